pub mod backoff;
pub mod error;
pub mod mem;
pub mod store;
pub mod watcher;
pub mod xline;

// re-export selected public API
pub use backoff::Backoff;
pub use error::{StoreError, WatchError};
pub use mem::MemStore;
pub use store::{CasOutcome, KvEntry, KvStore, Snapshot};
pub use watcher::{WatchOptions, WatchResult, WatchStream, watch};
pub use xline::{XlineConfig, XlineStore};
