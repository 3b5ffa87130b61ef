#![allow(dead_code)]

use lockstep::{
    BinaryReader, BinaryWriter, ClientCommand, ClientLockstepController, CodecError, CommandError,
    CommandFactory, CommandFlags, LockstepClientConfig, LockstepCommand, LockstepConfig,
    Simulation, StateHasher,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Push {
    pub value: i32,
}

impl LockstepCommand for Push {
    fn type_code(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "push"
    }

    fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        w.write_i32(self.value);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
        self.value = r.read_i32()?;
        Ok(())
    }
}

/// Cosmetic command: not retried and left out of replays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wave;

impl LockstepCommand for Wave {
    fn type_code(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "wave"
    }

    fn flags(&self) -> CommandFlags {
        CommandFlags::empty()
    }

    fn serialize(&self, _w: &mut BinaryWriter) -> Result<(), CodecError> {
        Ok(())
    }

    fn deserialize(&mut self, _r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Tally {
    pub ticks: u32,
    pub sum: i64,
    pub applied: Vec<(u8, i32)>,
    pub waves: u32,
}

impl Simulation for Tally {
    fn simulate(&mut self, _step_ms: u32) {
        self.ticks += 1;
    }

    fn apply_command(&mut self, command: &ClientCommand) -> Result<(), CommandError> {
        if command.command.is::<Wave>() {
            self.waves += 1;
            return Ok(());
        }
        let push = command
            .command
            .downcast_ref::<Push>()
            .ok_or(CommandError::Unhandled(command.command.name()))?;
        self.sum += push.value as i64;
        self.applied.push((command.player, push.value));
        Ok(())
    }

    fn state_hash(&self) -> u64 {
        let mut hasher = StateHasher::new();
        hasher.write_u32(self.ticks);
        hasher.write_i64(self.sum);
        for (player, value) in &self.applied {
            hasher.write_bytes(&[*player]);
            hasher.write_u32(*value as u32);
        }
        hasher.finish()
    }
}

pub fn factory() -> CommandFactory {
    CommandFactory::new()
        .with::<Push>()
        .and_then(|f| f.with::<Wave>())
        .expect("command types are unique")
}

pub fn controller(factory: CommandFactory) -> ClientLockstepController<Tally> {
    ClientLockstepController::new(
        LockstepConfig::default(),
        LockstepClientConfig::default(),
        factory,
        Tally::default(),
    )
}
