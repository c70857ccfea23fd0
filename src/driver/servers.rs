//! Server list rotation.

use crate::config::Endpoint;
use crate::error::DriverError;

/// Cursor over the configured server list.
///
/// The list itself is re-read from configuration on every call, so it may
/// change between attempts; the cursor wraps modulo the current length.
#[derive(Debug, Default)]
pub struct ServerRotation {
    index: usize,
    current: Option<Endpoint>,
}

impl ServerRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint chosen by the most recent [`next`](Self::next).
    pub fn current(&self) -> Option<&Endpoint> {
        self.current.as_ref()
    }

    /// Advance to the next endpoint, wrapping after the last entry.
    ///
    /// Returns the endpoint and whether it differs from the previous
    /// choice; the caller resets its backoff on a change.
    pub fn next(
        &mut self,
        servers: &[Endpoint],
        network: &str,
    ) -> Result<(Endpoint, bool), DriverError> {
        if servers.is_empty() {
            return Err(DriverError::NoServersConfigured(network.to_string()));
        }
        let server = servers[self.index % servers.len()].clone();
        self.index = (self.index + 1) % servers.len();
        let changed = self.current.as_ref() != Some(&server);
        self.current = Some(server.clone());
        Ok((server, changed))
    }
}
