use serde::{Deserialize, Serialize};

use crate::codec::{BinaryReader, BinaryWriter};
use crate::error::CodecError;
use crate::turn::MAX_EMPTY_RUN;

pub const DEFAULT_COMMAND_STEP_DURATION: u32 = 100;
pub const DEFAULT_SIMULATION_STEP_DURATION: u32 = 100;
pub const DEFAULT_MAX_SKIPPED_EMPTY_TURNS: u32 = 10;

/// Timing shared by the server and every client. Sent to clients on setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Length of one turn in milliseconds.
    pub command_step_duration: u32,
    pub simulation_step_duration: u32,
    /// Missing turns tolerated before a client counts as desynchronized.
    pub max_skipped_empty_turns: u32,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            command_step_duration: DEFAULT_COMMAND_STEP_DURATION,
            simulation_step_duration: DEFAULT_SIMULATION_STEP_DURATION,
            max_skipped_empty_turns: DEFAULT_MAX_SKIPPED_EMPTY_TURNS,
        }
    }
}

impl LockstepConfig {
    /// Turn that contains the instant `time_ms`.
    pub fn turn_at(&self, time_ms: i64) -> u32 {
        if time_ms <= 0 {
            0
        } else {
            (time_ms / self.command_step_duration.max(1) as i64) as u32
        }
    }

    pub fn write(&self, w: &mut BinaryWriter) {
        w.write_u32(self.command_step_duration);
        w.write_u32(self.simulation_step_duration);
        w.write_u32(self.max_skipped_empty_turns);
    }

    pub fn read(r: &mut BinaryReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            command_step_duration: r.read_u32()?,
            simulation_step_duration: r.read_u32()?,
            max_skipped_empty_turns: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockstepServerConfig {
    pub max_players: u8,
    /// Grace period before the first turn, absorbing connection jitter.
    pub client_start_delay: i32,
    /// How far clients run behind the server.
    pub client_simulation_delay: i32,
    pub finish_on_client_disconnection: bool,
    pub allow_battle_start_with_one_player_ready: bool,
    /// Seconds to wait for the remaining results after the first one arrives.
    pub battle_ended_without_confirmation_timeout: u32,
    /// Diagnostic switch. When off, finalized turns are not transmitted.
    pub allow_send_turn: bool,
}

impl Default for LockstepServerConfig {
    fn default() -> Self {
        Self {
            max_players: 2,
            client_start_delay: 3000,
            client_simulation_delay: 1000,
            finish_on_client_disconnection: true,
            allow_battle_start_with_one_player_ready: false,
            battle_ended_without_confirmation_timeout: 10,
            allow_send_turn: true,
        }
    }
}

impl LockstepServerConfig {
    /// Longest run of empty turns held back before it is sent. Half of the
    /// client simulation delay, so buffered clients never starve.
    pub fn empty_turns_batch(&self, command_step_duration: u32) -> u32 {
        let step = command_step_duration.max(1) as i64;
        let batch = self.client_simulation_delay.max(0) as i64 / (2 * step);
        batch.clamp(1, MAX_EMPTY_RUN as i64) as u32
    }

    pub fn start_time(&self) -> i64 {
        self.client_simulation_delay as i64 - self.client_start_delay as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockstepClientConfig {
    /// Lag applied to commands confirmed locally when no server is attached.
    pub local_simulation_delay: i32,
    /// Zero means unbounded.
    pub max_simulation_steps_per_frame: u32,
    pub speed_factor: f32,
    /// Diagnostic switch. When off, commands stay pending and are not sent.
    pub allow_send_turn: bool,
}

impl Default for LockstepClientConfig {
    fn default() -> Self {
        Self {
            local_simulation_delay: 1000,
            max_simulation_steps_per_frame: 0,
            speed_factor: 1.0,
            allow_send_turn: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_turn_batch_follows_simulation_delay() {
        let config = LockstepServerConfig::default();
        assert_eq!(config.empty_turns_batch(100), 5);

        let tight = LockstepServerConfig {
            client_simulation_delay: 0,
            ..Default::default()
        };
        assert_eq!(tight.empty_turns_batch(100), 1);
    }

    #[test]
    fn server_starts_in_grace_period() {
        assert_eq!(LockstepServerConfig::default().start_time(), -2000);
    }

    #[test]
    fn turn_at_time() {
        let config = LockstepConfig::default();
        assert_eq!(config.turn_at(-50), 0);
        assert_eq!(config.turn_at(99), 0);
        assert_eq!(config.turn_at(250), 2);
    }
}
