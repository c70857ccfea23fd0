//! Driver error taxonomy.
//!
//! Socket-level failures never appear here: the pump classifies them as
//! transient or fatal internally and drives the reconnect state machine
//! instead of bubbling them out of a tick.

use thiserror::Error;

/// Errors surfaced by the connection driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The network has no servers configured. Fails fast rather than
    /// spinning in a retry loop.
    #[error("no servers configured for network {0}")]
    NoServersConfigured(String),

    /// A reconnect or connectedness check was scheduled while another
    /// callback was still outstanding. This is a caller bug and is never
    /// silently absorbed.
    #[error("a driver callback is already scheduled")]
    DuplicateSchedule,

    /// Every configured endpoint requires TLS, which this driver does not
    /// speak.
    #[error("the socket driver cannot connect to TLS servers; use a TLS-capable driver")]
    TlsUnsupported,
}
