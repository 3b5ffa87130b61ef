use std::fs;
use std::path::Path;

use log::debug;

use crate::codec::{BinaryReader, BinaryWriter};
use crate::config::LockstepConfig;
use crate::error::{ProtocolError, ReplayError};
use crate::turn::{EmptyTurns, Turn, TurnMessage, compress_turns};

pub const REPLAY_MAGIC: [u8; 4] = *b"LSRP";
pub const REPLAY_FORMAT_VERSION: u8 = 1;

/// Upper bound on turns a loaded replay may expand to.
pub const MAX_REPLAY_TURNS: usize = 1 << 24;

const ENTRY_TURN: u8 = 0;
const ENTRY_EMPTY: u8 = 1;

/// A recorded session: the timing it ran with, its seed and every applied
/// turn in order.
///
/// Binary layout, little-endian:
///
/// ```text
/// magic "LSRP" | version u8 | config (3 x u32) | seed u64 | entries u32
/// entry: 0 | turn u32 | Turn      or      1 | first u32 | count u32
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayLog {
    pub config: LockstepConfig,
    pub seed: u64,
    turns: Vec<(u32, Turn)>,
}

impl ReplayLog {
    pub fn new(config: LockstepConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            turns: Vec::new(),
        }
    }

    /// Appends a turn. Numbers must be strictly increasing.
    pub fn push(&mut self, number: u32, turn: Turn) -> Result<(), ReplayError> {
        if let Some(previous) = self.last_turn() {
            if number <= previous {
                return Err(ReplayError::OutOfOrder {
                    previous,
                    turn: number,
                });
            }
        }
        self.turns.push((number, turn));
        Ok(())
    }

    pub fn turns(&self) -> &[(u32, Turn)] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_turn(&self) -> Option<u32> {
        self.turns.last().map(|(number, _)| *number)
    }

    pub fn command_count(&self) -> usize {
        self.turns.iter().map(|(_, turn)| turn.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplayError> {
        let entries = compress_turns(self.turns.iter().cloned());
        let mut w = BinaryWriter::with_capacity(32 + entries.len() * 8);
        w.write_raw(&REPLAY_MAGIC);
        w.write_u8(REPLAY_FORMAT_VERSION);
        self.config.write(&mut w);
        w.write_u64(self.seed);
        w.write_u32(entries.len() as u32);
        for entry in &entries {
            match entry {
                TurnMessage::Turn { number, turn } => {
                    w.write_u8(ENTRY_TURN);
                    w.write_u32(*number);
                    turn.write(&mut w)?;
                }
                TurnMessage::Empty(empty) => {
                    w.write_u8(ENTRY_EMPTY);
                    empty.write(&mut w);
                }
            }
        }
        Ok(w.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        let mut r = BinaryReader::new(bytes);
        if r.read_raw(REPLAY_MAGIC.len()).ok() != Some(&REPLAY_MAGIC[..]) {
            return Err(ReplayError::InvalidMagic);
        }
        let version = r.read_u8()?;
        if version != REPLAY_FORMAT_VERSION {
            return Err(ReplayError::UnsupportedVersion {
                found: version,
                expected: REPLAY_FORMAT_VERSION,
            });
        }
        let config = LockstepConfig::read(&mut r)?;
        let seed = r.read_u64()?;
        let count = r.read_u32()?;

        let mut log = Self::new(config, seed);
        for _ in 0..count {
            let entry = match r.read_u8()? {
                ENTRY_TURN => TurnMessage::Turn {
                    number: r.read_u32()?,
                    turn: Turn::read(&mut r)?,
                },
                ENTRY_EMPTY => TurnMessage::Empty(EmptyTurns::read(&mut r)?),
                tag => return Err(ReplayError::UnknownEntry(tag)),
            };
            let expanded = match &entry {
                TurnMessage::Turn { .. } => 1,
                TurnMessage::Empty(empty) => empty.count as usize,
            };
            if log.len() + expanded > MAX_REPLAY_TURNS {
                return Err(ReplayError::TooManyTurns {
                    limit: MAX_REPLAY_TURNS,
                });
            }
            for (number, turn) in entry.expand() {
                log.push(number, turn)?;
            }
        }
        if !r.is_finished() {
            return Err(ProtocolError::TrailingBytes {
                context: "replay",
                trailing: r.remaining(),
            }
            .into());
        }
        debug!(
            "loaded replay with {} turns ({} entries, seed {})",
            log.len(),
            count,
            seed
        );
        Ok(log)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReplayError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Self::from_bytes(&fs::read(path)?)
    }
}
