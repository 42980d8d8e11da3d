//! Runtime support
//!
//! Shutdown signaling shared by the worker and its consumer tasks.

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};
