pub mod codec;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod hash;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod replay;
pub mod turn;

pub use codec::{BinaryReader, BinaryWriter, DiffParser, DiffSerializer, DirtyBits};
pub use command::{ClientCommand, CommandFactory, CommandFlags, LockstepCommand, TurnCommand};
pub use config::{LockstepClientConfig, LockstepConfig, LockstepServerConfig};
pub use controller::{
    ClientEvent, ClientLockstepController, CommandAdmission, ConnectionState, ControllerState,
    ServerLockstepController, Simulation,
};
pub use error::{
    CodecError, CommandError, ProtocolError, QueueError, ReplayError, TransportError,
};
pub use hash::{StateHasher, fnv1a64};
pub use network::{
    ClientId, ClientTransport, LockstepNetworkClient, LockstepNetworkServer, LoopbackHub,
    ServerTransport,
};
pub use protocol::{LockstepMessage, MessageType, PROTOCOL_VERSION};
pub use queue::{CommandPacket, CommandQueue, CommandQueueConfig, RetryPolicy};
pub use replay::{ReplayLog, ReplayPlayer, ReplayRecorder};
pub use turn::{ClientTurn, EmptyTurns, Turn, TurnMessage};
