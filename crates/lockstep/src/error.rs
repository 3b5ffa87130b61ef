use std::io;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("length {0} does not fit a u16 prefix")]
    LengthOverflow(usize),
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid run of {count} empty turns from turn {first_turn}")]
    InvalidTurnRange { first_turn: u32, count: u32 },
}

/// A violation of the lockstep wire contract. Fatal to the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command type code {0}")]
    UnknownCommandType(u8),
    #[error("command type code {0} registered twice")]
    DuplicateCommandType(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
    #[error("{trailing} trailing bytes after {context}")]
    TrailingBytes { context: &'static str, trailing: usize },
    #[error("message from unknown client {0}")]
    UnknownClient(u32),
    #[error("message {msg_type} received before setup")]
    NotSetUp { msg_type: u8 },
    #[error("message {0} is not valid in this direction")]
    UnexpectedMessage(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("no connection for client {0}")]
    UnknownClient(u32),
    #[error("send rejected: {0}")]
    Rejected(String),
    #[error("packet {0} was not acknowledged in time")]
    Timeout(u32),
    #[error("corrupt frame: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("command queue is not running")]
    NotRunning,
    #[error("command queue was reset")]
    Reset,
    #[error("command cancelled before send")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("packet {packet_id} failed after {retries} retries")]
    RetriesExhausted { packet_id: u32, retries: u32 },
}

/// Raised by a simulation when a command cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command {name} rejected: {reason}")]
    Rejected { name: &'static str, reason: String },
    #[error("no logic handles command {0}")]
    Unhandled(&'static str),
    #[error("controller is not running")]
    NotRunning,
    #[error("command could not be encoded: {0}")]
    Encode(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unsupported format version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("malformed replay: {0}")]
    Malformed(#[from] CodecError),
    #[error("unknown entry tag {0}")]
    UnknownEntry(u8),
    #[error("turn {turn} appended after turn {previous}")]
    OutOfOrder { previous: u32, turn: u32 },
    #[error("replay contains no turns")]
    Empty,
    #[error("replay holds more than {limit} turns")]
    TooManyTurns { limit: usize },
    #[error("recorded turn could not be decoded: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("playback stalled at turn {turn}")]
    Stalled { turn: u32 },
}
