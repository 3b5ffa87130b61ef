use super::file::ReplayLog;
use crate::config::LockstepConfig;
use crate::error::ReplayError;
use crate::turn::Turn;

/// Collects applied turns into a [`ReplayLog`].
#[derive(Debug)]
pub struct ReplayRecorder {
    log: ReplayLog,
}

impl ReplayRecorder {
    pub fn new(config: LockstepConfig, seed: u64) -> Self {
        Self {
            log: ReplayLog::new(config, seed),
        }
    }

    /// Appends an applied turn, empty ones included.
    pub fn record(&mut self, number: u32, turn: Turn) -> Result<(), ReplayError> {
        self.log.push(number, turn)
    }

    pub fn recorded_turns(&self) -> usize {
        self.log.len()
    }

    pub fn log(&self) -> &ReplayLog {
        &self.log
    }

    pub fn finish(self) -> ReplayLog {
        self.log
    }
}
