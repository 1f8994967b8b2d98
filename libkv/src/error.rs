use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("revision {requested} has been compacted (compact revision {compacted})")]
    Compacted { requested: i64, compacted: i64 },
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether retrying the same call later can succeed without anyone
    /// changing configuration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Compacted { .. }
        )
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        use tonic::Code;
        match &e {
            etcd_client::Error::GRpcStatus(status) => match status.code() {
                Code::PermissionDenied | Code::Unauthenticated => {
                    StoreError::Unauthorized(status.message().to_string())
                }
                Code::NotFound => StoreError::NotFound(status.message().to_string()),
                Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                    StoreError::Invalid(status.message().to_string())
                }
                _ => StoreError::Unavailable(e.to_string()),
            },
            etcd_client::Error::InvalidArgs(msg) => StoreError::Invalid(msg.clone()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// A failed step of a watch. The watch keeps going after it; the error is
/// handed to the consumer so it can be logged.
#[derive(Debug, thiserror::Error)]
#[error("watch of {prefix} failed (attempt {attempt}, retrying in {retry_in:?}): {source}")]
pub struct WatchError {
    pub prefix: String,
    pub attempt: u32,
    pub retry_in: Duration,
    #[source]
    pub source: StoreError,
}

impl WatchError {
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}
