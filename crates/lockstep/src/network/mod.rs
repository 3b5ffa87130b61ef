//! Binds the controllers to a message transport.

mod client;
pub mod loopback;
mod server;
mod transport;

pub use client::{ClientPhase, DEFAULT_RESYNC_INTERVAL_MS, LockstepNetworkClient};
pub use loopback::{
    Frame, LinkConditions, LinkStats, LoopbackClient, LoopbackHub, LoopbackServer, ServerIncoming,
};
pub use server::{LOCAL_CLIENT_ID, LockstepNetworkServer, MatchState, ServerEvent, ServerStats};
pub use transport::{ClientId, ClientTransport, ServerTransport};
