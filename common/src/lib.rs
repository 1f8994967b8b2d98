pub mod hooks;
pub mod manifest;
pub mod paths;

// re-export selected public API
pub use hooks::{HookType, HookTypeError};
pub use manifest::{DecodeError, Manifest, decode_manifest};
pub use paths::{DEFAULT_PREFIX, HookBinding, HookScope, PathError, StorePaths, slot_of};
