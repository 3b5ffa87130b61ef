use crate::error::TransportError;

pub type ClientId = u32;

/// Client end of a message transport. Payloads are already encoded; the
/// message type travels beside them.
pub trait ClientTransport {
    fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), TransportError>;

    /// Milliseconds elapsed since the server stamped `server_timestamp`.
    /// Transports without a shared clock report zero.
    fn delay_since(&self, _server_timestamp: u64) -> i64 {
        0
    }
}

pub trait ServerTransport {
    fn send(&mut self, client: ClientId, msg_type: u8, payload: &[u8])
    -> Result<(), TransportError>;

    /// Current server clock in milliseconds, stamped into `ClientStart`.
    fn timestamp(&self) -> u64 {
        0
    }
}
