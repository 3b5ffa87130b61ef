use crate::codec::{BinaryReader, BinaryWriter};
use crate::command::TurnCommand;
use crate::error::{CodecError, TransportError};

/// Packet id 0 is never assigned by a queue. It marks fire-and-forget batches
/// that the receiver must not acknowledge.
pub const UNACKED_PACKET_ID: u32 = 0;

/// A batch of queued commands as it travels to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u32,
    pub commands: Vec<TurnCommand>,
}

impl CommandPacket {
    pub fn needs_ack(&self) -> bool {
        self.id != UNACKED_PACKET_ID
    }

    pub fn write(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        w.write_u32(self.id);
        let count = u16::try_from(self.commands.len())
            .map_err(|_| CodecError::LengthOverflow(self.commands.len()))?;
        w.write_u16(count);
        for command in &self.commands {
            command.write(w)?;
        }
        Ok(())
    }

    pub fn read(r: &mut BinaryReader<'_>) -> Result<Self, CodecError> {
        let id = r.read_u32()?;
        let count = r.read_u16()? as usize;
        let mut commands = Vec::with_capacity(count);
        for _ in 0..count {
            commands.push(TurnCommand::read(r)?);
        }
        Ok(Self { id, commands })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// The transport confirmed delivery synchronously.
    Delivered,
    /// Handed off; completion arrives later through `CommandQueue::complete_send`.
    Pending,
    Failed(TransportError),
}

/// Outbound side of the command queue.
pub trait PacketTransport {
    fn send_packet(&mut self, packet: &CommandPacket) -> SendStatus;
}

impl<F> PacketTransport for F
where
    F: FnMut(&CommandPacket) -> SendStatus,
{
    fn send_packet(&mut self, packet: &CommandPacket) -> SendStatus {
        self(packet)
    }
}
