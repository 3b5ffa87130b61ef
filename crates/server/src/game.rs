use glam::{Quat, Vec3};

use lockstep::codec::{DiffSerializer, Transform, TransformCodec, write_delta};
use lockstep::{
    BinaryReader, BinaryWriter, ClientCommand, CodecError, CommandError, CommandFactory,
    CommandFlags, LockstepCommand, ProtocolError, Simulation, StateHasher,
};

/// Units per second.
const MOVE_SPEED: f32 = 4.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveTo {
    pub target: Vec3,
}

impl LockstepCommand for MoveTo {
    fn type_code(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "move_to"
    }

    fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        w.write_f32(self.target.x);
        w.write_f32(self.target.y);
        w.write_f32(self.target.z);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
        self.target = Vec3::new(r.read_f32()?, r.read_f32()?, r.read_f32()?);
        Ok(())
    }
}

/// Chat-style marker. Sent once, never replayed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ping {
    pub sequence: u16,
}

impl LockstepCommand for Ping {
    fn type_code(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "ping"
    }

    fn flags(&self) -> CommandFlags {
        CommandFlags::empty()
    }

    fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        w.write_u16(self.sequence);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
        self.sequence = r.read_u16()?;
        Ok(())
    }
}

pub fn command_factory() -> Result<CommandFactory, ProtocolError> {
    CommandFactory::new().with::<MoveTo>()?.with::<Ping>()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Avatar {
    pub transform: Transform,
    pub target: Vec3,
}

/// Every player steers one avatar toward the last requested target.
#[derive(Debug, Default)]
pub struct Arena {
    avatars: Vec<Avatar>,
    steps: u64,
    moves: u32,
    pings: u32,
}

impl Arena {
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn moves(&self) -> u32 {
        self.moves
    }

    pub fn pings(&self) -> u32 {
        self.pings
    }

    pub fn transforms(&self) -> Vec<Transform> {
        self.avatars.iter().map(|a| a.transform).collect()
    }

    fn avatar_mut(&mut self, player: u8) -> &mut Avatar {
        let index = player as usize;
        if self.avatars.len() <= index {
            self.avatars.resize(index + 1, Avatar::default());
        }
        &mut self.avatars[index]
    }
}

impl Simulation for Arena {
    fn simulate(&mut self, step_ms: u32) {
        let max_distance = MOVE_SPEED * step_ms as f32 / 1000.0;
        for avatar in &mut self.avatars {
            let to_target = avatar.target - avatar.transform.position;
            let distance = to_target.length();
            if distance <= f32::EPSILON {
                continue;
            }
            if distance <= max_distance {
                avatar.transform.position = avatar.target;
            } else {
                avatar.transform.position += to_target / distance * max_distance;
            }
            avatar.transform.rotation = Quat::from_rotation_y(to_target.x.atan2(to_target.z));
        }
        self.steps += 1;
    }

    fn apply_command(&mut self, command: &ClientCommand) -> Result<(), CommandError> {
        if command.command.is::<Ping>() {
            self.pings += 1;
            return Ok(());
        }
        let Some(move_to) = command.command.downcast_ref::<MoveTo>() else {
            return Err(CommandError::Unhandled(command.command.name()));
        };
        if !move_to.target.is_finite() {
            return Err(CommandError::Rejected {
                name: move_to.name(),
                reason: "target is not finite".to_owned(),
            });
        }
        self.avatar_mut(command.player).target = move_to.target;
        self.moves += 1;
        Ok(())
    }

    fn state_hash(&self) -> u64 {
        let mut hasher = StateHasher::new();
        hasher.write_u64(self.steps);
        hasher.write_u32(self.moves);
        for avatar in &self.avatars {
            let t = &avatar.transform;
            for value in t.position.to_array() {
                hasher.write_f32(value);
            }
            for value in t.rotation.to_array() {
                hasher.write_f32(value);
            }
            for value in avatar.target.to_array() {
                hasher.write_f32(value);
            }
        }
        hasher.finish()
    }
}

/// Size of avatar transforms sent in full versus as deltas against the
/// previous sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaReport {
    pub samples: u64,
    pub full_bytes: u64,
    pub delta_bytes: u64,
}

impl DeltaReport {
    pub fn sample(&mut self, previous: &[Transform], current: &[Transform]) {
        let codec = TransformCodec::SHORT;
        for (index, transform) in current.iter().enumerate() {
            let mut full = BinaryWriter::new();
            codec.serialize(transform, &mut full);
            let mut delta = BinaryWriter::new();
            match previous.get(index) {
                Some(before) => {
                    write_delta(&codec, transform, before, &mut delta);
                }
                None => codec.serialize(transform, &mut delta),
            }
            self.full_bytes += full.len() as u64;
            self.delta_bytes += delta.len() as u64;
        }
        self.samples += 1;
    }

    /// Delta size as a fraction of the full size.
    pub fn ratio(&self) -> f64 {
        if self.full_bytes == 0 {
            1.0
        } else {
            self.delta_bytes as f64 / self.full_bytes as f64
        }
    }
}
