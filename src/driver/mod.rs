//! Capture driver: session loop, interrupt handling and exit status.

pub mod session;
pub mod signal;

pub use session::{ExitStatus, RunSummary, Session, SessionConfig, SessionError, StopReason};
pub use signal::install_interrupt_handler;
