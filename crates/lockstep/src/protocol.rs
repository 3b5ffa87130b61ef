use crate::codec::{BinaryReader, BinaryWriter};
use crate::config::LockstepConfig;
use crate::error::{CodecError, ProtocolError};
use crate::queue::CommandPacket;
use crate::turn::{EmptyTurns, Turn, TurnMessage};

pub const PROTOCOL_VERSION: u32 = 1;

/// Leading byte of every lockstep message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Command = 2,
    Turn = 3,
    EmptyTurns = 4,
    ClientSetup = 5,
    PlayerReady = 6,
    ClientStart = 7,
    PlayerFinish = 8,
    ClientEnd = 9,
    ClientConnectionStatus = 10,
    CommandAck = 11,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Messages a client may send. Everything else flows server to client.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            MessageType::Command | MessageType::PlayerReady | MessageType::PlayerFinish
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            2 => MessageType::Command,
            3 => MessageType::Turn,
            4 => MessageType::EmptyTurns,
            5 => MessageType::ClientSetup,
            6 => MessageType::PlayerReady,
            7 => MessageType::ClientStart,
            8 => MessageType::PlayerFinish,
            9 => MessageType::ClientEnd,
            10 => MessageType::ClientConnectionStatus,
            11 => MessageType::CommandAck,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockstepMessage {
    Command(CommandPacket),
    Turn {
        number: u32,
        turn: Turn,
    },
    EmptyTurns(EmptyTurns),
    ClientSetup {
        config: LockstepConfig,
        seed: u64,
    },
    PlayerReady {
        player_token: String,
        current_turn: u32,
        version: u32,
    },
    /// `start_time` is the client clock at `server_timestamp`, before any
    /// transit delay is added. `first_command_id` skips ids the player's slot
    /// already used, so a reconnecting process does not reuse them.
    ClientStart {
        server_timestamp: u64,
        start_time: i64,
        player_count: u8,
        player_number: u8,
        first_command_id: u32,
    },
    PlayerFinish {
        result: Vec<u8>,
    },
    ClientEnd {
        results: Vec<(u8, Vec<u8>)>,
    },
    ClientConnectionStatus {
        player: u8,
        connected: bool,
    },
    CommandAck {
        packet_id: u32,
    },
}

impl From<TurnMessage> for LockstepMessage {
    fn from(message: TurnMessage) -> Self {
        match message {
            TurnMessage::Turn { number, turn } => LockstepMessage::Turn { number, turn },
            TurnMessage::Empty(empty) => LockstepMessage::EmptyTurns(empty),
        }
    }
}

impl LockstepMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            LockstepMessage::Command(_) => MessageType::Command,
            LockstepMessage::Turn { .. } => MessageType::Turn,
            LockstepMessage::EmptyTurns(_) => MessageType::EmptyTurns,
            LockstepMessage::ClientSetup { .. } => MessageType::ClientSetup,
            LockstepMessage::PlayerReady { .. } => MessageType::PlayerReady,
            LockstepMessage::ClientStart { .. } => MessageType::ClientStart,
            LockstepMessage::PlayerFinish { .. } => MessageType::PlayerFinish,
            LockstepMessage::ClientEnd { .. } => MessageType::ClientEnd,
            LockstepMessage::ClientConnectionStatus { .. } => MessageType::ClientConnectionStatus,
            LockstepMessage::CommandAck { .. } => MessageType::CommandAck,
        }
    }

    /// Writes the message body. The type code travels separately.
    pub fn write(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        match self {
            LockstepMessage::Command(packet) => packet.write(w)?,
            LockstepMessage::Turn { number, turn } => {
                w.write_u32(*number);
                turn.write(w)?;
            }
            LockstepMessage::EmptyTurns(empty) => empty.write(w),
            LockstepMessage::ClientSetup { config, seed } => {
                config.write(w);
                w.write_u64(*seed);
            }
            LockstepMessage::PlayerReady {
                player_token,
                current_turn,
                version,
            } => {
                w.write_string(player_token)?;
                w.write_u32(*current_turn);
                w.write_u32(*version);
            }
            LockstepMessage::ClientStart {
                server_timestamp,
                start_time,
                player_count,
                player_number,
                first_command_id,
            } => {
                w.write_u64(*server_timestamp);
                w.write_i64(*start_time);
                w.write_u8(*player_count);
                w.write_u8(*player_number);
                w.write_u32(*first_command_id);
            }
            LockstepMessage::PlayerFinish { result } => w.write_bytes(result)?,
            LockstepMessage::ClientEnd { results } => {
                let count =
                    u8::try_from(results.len()).map_err(|_| CodecError::LengthOverflow(results.len()))?;
                w.write_u8(count);
                for (player, result) in results {
                    w.write_u8(*player);
                    w.write_bytes(result)?;
                }
            }
            LockstepMessage::ClientConnectionStatus { player, connected } => {
                w.write_u8(*player);
                w.write_bool(*connected);
            }
            LockstepMessage::CommandAck { packet_id } => w.write_u32(*packet_id),
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = BinaryWriter::new();
        self.write(&mut w)?;
        Ok(w.into_bytes())
    }

    /// Reads a message body of type `msg_type`. The reader must be exhausted
    /// afterwards.
    pub fn read(msg_type: u8, r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        let kind = MessageType::try_from(msg_type)?;
        let message = match kind {
            MessageType::Command => LockstepMessage::Command(CommandPacket::read(r)?),
            MessageType::Turn => LockstepMessage::Turn {
                number: r.read_u32()?,
                turn: Turn::read(r)?,
            },
            MessageType::EmptyTurns => LockstepMessage::EmptyTurns(EmptyTurns::read(r)?),
            MessageType::ClientSetup => LockstepMessage::ClientSetup {
                config: LockstepConfig::read(r)?,
                seed: r.read_u64()?,
            },
            MessageType::PlayerReady => LockstepMessage::PlayerReady {
                player_token: r.read_string()?,
                current_turn: r.read_u32()?,
                version: r.read_u32()?,
            },
            MessageType::ClientStart => LockstepMessage::ClientStart {
                server_timestamp: r.read_u64()?,
                start_time: r.read_i64()?,
                player_count: r.read_u8()?,
                player_number: r.read_u8()?,
                first_command_id: r.read_u32()?,
            },
            MessageType::PlayerFinish => LockstepMessage::PlayerFinish {
                result: r.read_bytes()?,
            },
            MessageType::ClientEnd => {
                let count = r.read_u8()?;
                let mut results = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    results.push((r.read_u8()?, r.read_bytes()?));
                }
                LockstepMessage::ClientEnd { results }
            }
            MessageType::ClientConnectionStatus => LockstepMessage::ClientConnectionStatus {
                player: r.read_u8()?,
                connected: r.read_bool()?,
            },
            MessageType::CommandAck => LockstepMessage::CommandAck {
                packet_id: r.read_u32()?,
            },
        };
        if !r.is_finished() {
            return Err(ProtocolError::TrailingBytes {
                context: "message",
                trailing: r.remaining(),
            });
        }
        Ok(message)
    }

    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::read(msg_type, &mut BinaryReader::new(payload))
    }
}
