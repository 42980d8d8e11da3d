//! Worker orchestration
//!
//! The worker owns the coordination loop and the consumer task pool; its
//! identity doubles as the lease owner field.

pub mod core;
pub mod identity;
pub mod state;

pub use self::core::{ShutdownReport, Worker};
pub use identity::WorkerIdentity;
pub use state::{PhasePublisher, WorkerPhase};
