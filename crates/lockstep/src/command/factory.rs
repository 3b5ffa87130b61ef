use std::collections::HashMap;

use super::types::{ClientCommand, LockstepCommand, TurnCommand};
use crate::codec::BinaryReader;
use crate::error::ProtocolError;

type Constructor = fn() -> Box<dyn LockstepCommand>;

fn construct<C: LockstepCommand + Default + 'static>() -> Box<dyn LockstepCommand> {
    Box::new(C::default())
}

/// Type code to constructor table, filled once at startup.
#[derive(Debug, Clone, Default)]
pub struct CommandFactory {
    constructors: HashMap<u8, (Constructor, &'static str)>,
}

impl CommandFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `C` under the type code reported by `C::default()`.
    pub fn register<C: LockstepCommand + Default + 'static>(&mut self) -> Result<u8, ProtocolError> {
        let prototype = C::default();
        let code = prototype.type_code();
        if self.constructors.contains_key(&code) {
            return Err(ProtocolError::DuplicateCommandType(code));
        }
        self.constructors
            .insert(code, (construct::<C>, prototype.name()));
        Ok(code)
    }

    pub fn with<C: LockstepCommand + Default + 'static>(mut self) -> Result<Self, ProtocolError> {
        self.register::<C>()?;
        Ok(self)
    }

    pub fn contains(&self, type_code: u8) -> bool {
        self.constructors.contains_key(&type_code)
    }

    pub fn name_of(&self, type_code: u8) -> Option<&'static str> {
        self.constructors.get(&type_code).map(|(_, name)| *name)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    pub fn create(&self, type_code: u8) -> Result<Box<dyn LockstepCommand>, ProtocolError> {
        self.constructors
            .get(&type_code)
            .map(|(ctor, _)| ctor())
            .ok_or(ProtocolError::UnknownCommandType(type_code))
    }

    /// Instantiates the command for `type_code` and reads `payload` into it.
    /// The payload must be consumed exactly.
    pub fn decode(
        &self,
        type_code: u8,
        payload: &[u8],
    ) -> Result<Box<dyn LockstepCommand>, ProtocolError> {
        let mut command = self.create(type_code)?;
        let mut reader = BinaryReader::new(payload);
        command.deserialize(&mut reader)?;
        if !reader.is_finished() {
            return Err(ProtocolError::TrailingBytes {
                context: command.name(),
                trailing: reader.remaining(),
            });
        }
        Ok(command)
    }

    /// Encodes a command for the wire. Unregistered types are refused so that
    /// a peer never receives a code it cannot decode.
    pub fn encode(
        &self,
        id: u32,
        player: u8,
        command: &dyn LockstepCommand,
    ) -> Result<TurnCommand, ProtocolError> {
        if !self.contains(command.type_code()) {
            return Err(ProtocolError::UnknownCommandType(command.type_code()));
        }
        Ok(TurnCommand::encode(id, player, command)?)
    }

    pub fn decode_turn_command(&self, wire: &TurnCommand) -> Result<ClientCommand, ProtocolError> {
        Ok(ClientCommand {
            id: wire.id,
            player: wire.player,
            command: self.decode(wire.type_code, &wire.payload)?,
        })
    }
}
