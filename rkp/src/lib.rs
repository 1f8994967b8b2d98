pub mod command;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod logging;
pub mod preparer;
pub mod reconciler;
pub mod render;
pub mod shutdown;
