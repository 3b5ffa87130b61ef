use log::{debug, info};

use super::file::ReplayLog;
use crate::controller::{ClientLockstepController, ControllerState, Simulation};
use crate::error::ReplayError;

/// Frames without a new turn tolerated before playback counts as stalled.
const MAX_IDLE_FRAMES: u32 = 64;

/// Drives a client controller from a recorded turn stream.
#[derive(Debug, Clone)]
pub struct ReplayPlayer {
    log: ReplayLog,
    last_turn: u32,
}

impl ReplayPlayer {
    pub fn new(log: ReplayLog) -> Result<Self, ReplayError> {
        let last_turn = log.last_turn().ok_or(ReplayError::Empty)?;
        Ok(Self { log, last_turn })
    }

    pub fn log(&self) -> &ReplayLog {
        &self.log
    }

    pub fn last_turn(&self) -> u32 {
        self.last_turn
    }

    /// Resets `controller` into local mode with the recorded timing and
    /// confirms every recorded turn. The controller is started at time zero.
    pub fn attach<S: Simulation>(
        &self,
        controller: &mut ClientLockstepController<S>,
    ) -> Result<(), ReplayError> {
        controller.reset();
        controller.set_config(self.log.config);
        controller.set_networked(false);
        for (number, turn) in self.log.turns() {
            controller.add_confirmed_wire_turn(*number, turn)?;
        }
        controller.start(0);
        debug!(
            "replay attached: {} turns up to {}",
            self.log.len(),
            self.last_turn
        );
        Ok(())
    }

    /// Advances an attached controller one command step at a time until the
    /// last recorded turn has been applied. Returns the final state hash.
    pub fn run_to_end<S: Simulation>(
        &self,
        controller: &mut ClientLockstepController<S>,
    ) -> Result<u64, ReplayError> {
        let step = self.log.config.command_step_duration.max(1) as i64;
        let mut idle_frames = 0;
        while controller.current_turn() < self.last_turn {
            if controller.state() != ControllerState::Running {
                return Err(ReplayError::Stalled {
                    turn: controller.current_turn(),
                });
            }
            if controller.update(step) == 0 {
                idle_frames += 1;
                if idle_frames > MAX_IDLE_FRAMES {
                    return Err(ReplayError::Stalled {
                        turn: controller.current_turn(),
                    });
                }
            } else {
                idle_frames = 0;
            }
        }
        let hash = controller.simulation().state_hash();
        info!(
            "replay finished at turn {} with state hash {:016x}",
            self.last_turn, hash
        );
        Ok(hash)
    }

    pub fn play<S: Simulation>(
        &self,
        controller: &mut ClientLockstepController<S>,
    ) -> Result<u64, ReplayError> {
        self.attach(controller)?;
        self.run_to_end(controller)
    }
}
