//! Daemon Foundation: socket-bound singleton enforcement, client-side
//! `Ensure`, and connection-error classification shared by both Cortex daemons.

pub mod ensure;
pub mod singleton;

pub use ensure::{ensure_daemon, is_connection_error, Ensure};
pub use singleton::{bind_singleton, SingletonError, SingletonGuard};
