use std::any::Any;
use std::fmt;

use bitflags::bitflags;

use crate::codec::{BinaryReader, BinaryWriter};
use crate::error::CodecError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u8 {
        /// Sent through the command queue and retried until acknowledged.
        const RELIABLE = 1 << 0;
        /// Changes simulation state. Commands without it are left out of replays.
        const AFFECTS_SIMULATION = 1 << 1;
    }
}

impl Default for CommandFlags {
    fn default() -> Self {
        CommandFlags::RELIABLE | CommandFlags::AFFECTS_SIMULATION
    }
}

/// Object-safe cloning and downcasting, implemented for every `Clone` command.
pub trait CommandClone {
    fn box_clone(&self) -> Box<dyn LockstepCommand>;
    fn as_any(&self) -> &dyn Any;
}

impl<T> CommandClone for T
where
    T: LockstepCommand + Clone + 'static,
{
    fn box_clone(&self) -> Box<dyn LockstepCommand> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A discrete player or system action carried inside a turn.
///
/// The payload format belongs to the command alone. `deserialize` must read
/// exactly what `serialize` wrote.
pub trait LockstepCommand: CommandClone + fmt::Debug {
    fn type_code(&self) -> u8;

    fn name(&self) -> &'static str;

    fn flags(&self) -> CommandFlags {
        CommandFlags::default()
    }

    fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError>;

    fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError>;
}

impl dyn LockstepCommand {
    pub fn downcast_ref<T: LockstepCommand + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: LockstepCommand + 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl Clone for Box<dyn LockstepCommand> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Wire form of a command inside a turn. The server relays the payload without
/// decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCommand {
    pub id: u32,
    pub player: u8,
    pub type_code: u8,
    pub payload: Vec<u8>,
}

impl TurnCommand {
    pub fn encode(id: u32, player: u8, command: &dyn LockstepCommand) -> Result<Self, CodecError> {
        let mut w = BinaryWriter::new();
        command.serialize(&mut w)?;
        Ok(Self {
            id,
            player,
            type_code: command.type_code(),
            payload: w.into_bytes(),
        })
    }

    pub fn write(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        w.write_u32(self.id);
        w.write_u8(self.player);
        w.write_u8(self.type_code);
        w.write_bytes(&self.payload)
    }

    pub fn read(r: &mut BinaryReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: r.read_u32()?,
            player: r.read_u8()?,
            type_code: r.read_u8()?,
            payload: r.read_bytes()?,
        })
    }
}

/// A decoded command as seen by a client simulation.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    pub id: u32,
    pub player: u8,
    pub command: Box<dyn LockstepCommand>,
}

impl ClientCommand {
    pub fn to_wire(&self) -> Result<TurnCommand, CodecError> {
        TurnCommand::encode(self.id, self.player, self.command.as_ref())
    }
}
