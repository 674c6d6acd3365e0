//! Process coordination
//!
//! Shutdown signalling shared by the consumer loops and the health server.

pub mod shutdown;

pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownSignal, ShutdownToken};
