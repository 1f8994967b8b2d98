//! Level-triggered watches over a store prefix.
//!
//! [`watch`] returns a [`WatchStream`] that yields the full contents of a prefix
//! every time something beneath it changes. The stream is lazy (nothing is read
//! before the first poll), survives store failures by retrying with a bounded
//! exponential backoff, and only ends once its cancellation token fires.
//!
//! # Example
//! ```ignore
//! let cancel = CancellationToken::new();
//! let mut stream = watch(store, "/rk8s/preparer/intent/node-1/", WatchOptions::default(), cancel);
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(snapshot) => println!("{} pods at revision {}", snapshot.entries.len(), snapshot.revision),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//! ```

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, stream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    backoff::Backoff,
    error::{StoreError, WatchError},
    store::{KvStore, Snapshot},
};

pub type WatchResult = Result<Snapshot, WatchError>;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl WatchOptions {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff).with_multiplier(self.multiplier)
    }
}

/// Snapshots of one prefix, in non-decreasing revision order.
pub struct WatchStream {
    prefix: String,
    cancel: CancellationToken,
    inner: Pin<Box<dyn Stream<Item = WatchResult> + Send>>,
}

impl WatchStream {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// End the stream. No store call is issued after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for WatchStream {
    type Item = WatchResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Watch every key under `prefix`.
pub fn watch(
    store: Arc<dyn KvStore>,
    prefix: impl Into<String>,
    options: WatchOptions,
    cancel: CancellationToken,
) -> WatchStream {
    let prefix = prefix.into();
    let state = WatchState {
        store,
        prefix: prefix.clone(),
        cancel: cancel.clone(),
        backoff: options.backoff(),
        max_backoff: options.max_backoff,
        last_revision: None,
        step: Step::List,
        retry_after: None,
    };
    let inner = stream::unfold(state, |mut state| async move {
        let item = state.next_result().await?;
        Some((item, state))
    });
    WatchStream {
        prefix,
        cancel,
        inner: Box::pin(inner),
    }
}

enum Step {
    /// Read the whole prefix.
    List,
    /// Block until something under the prefix changes after `last_revision`.
    Wait,
}

struct WatchState {
    store: Arc<dyn KvStore>,
    prefix: String,
    cancel: CancellationToken,
    backoff: Backoff,
    max_backoff: Duration,
    last_revision: Option<i64>,
    step: Step,
    retry_after: Option<Duration>,
}

impl WatchState {
    /// Produce the next item, or `None` once cancelled.
    async fn next_result(&mut self) -> Option<WatchResult> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if let Some(delay) = self.retry_after.take() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    _ = sleep(delay) => {}
                }
            }

            if let Step::Wait = self.step {
                let after = self.last_revision.unwrap_or(0);
                let waited = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    res = self.store.wait_for_change(&self.prefix, after) => res,
                };
                match waited {
                    Ok(rev) => trace!(prefix = %self.prefix, rev, "change observed"),
                    Err(StoreError::Compacted { compacted, .. }) => {
                        // History is gone; a fresh read is all we need.
                        debug!(prefix = %self.prefix, compacted, "watch history compacted, re-reading");
                    }
                    Err(e) => return Some(Err(self.schedule_retry(e))),
                }
                self.step = Step::List;
            }

            let listed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                res = self.store.list(&self.prefix) => res,
            };
            let snapshot = match listed {
                Ok(snapshot) => snapshot,
                Err(e) => return Some(Err(self.schedule_retry(e))),
            };
            self.backoff.reset();
            self.step = Step::Wait;

            let last = self.last_revision.unwrap_or(i64::MIN);
            if snapshot.revision <= last {
                trace!(
                    prefix = %self.prefix,
                    revision = snapshot.revision,
                    last,
                    "dropping stale snapshot"
                );
                continue;
            }
            self.last_revision = Some(snapshot.revision);
            return Some(Ok(snapshot));
        }
    }

    fn schedule_retry(&mut self, source: StoreError) -> WatchError {
        let mut delay = self.backoff.next_delay();
        if !source.is_transient() {
            delay = self.max_backoff;
        }
        self.retry_after = Some(delay);
        // Whatever was missed while failing is picked up by a full read.
        self.step = Step::List;
        WatchError {
            prefix: self.prefix.clone(),
            attempt: self.backoff.attempt(),
            retry_in: delay,
            source,
        }
    }
}
