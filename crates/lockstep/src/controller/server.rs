use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use super::ControllerState;
use crate::command::TurnCommand;
use crate::config::{LockstepConfig, LockstepServerConfig};
use crate::turn::{EmptyTurns, Turn, TurnMessage, compress_turns};

/// Outcome of [`ServerLockstepController::add_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAdmission {
    Accepted,
    /// The `(player, id)` pair was already accepted earlier in the match.
    Duplicate,
    /// The server is not running and dropped the command.
    NotRunning,
}

impl CommandAdmission {
    /// Whether the command is, or already was, part of a turn.
    pub fn is_delivered(self) -> bool {
        self != CommandAdmission::NotRunning
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerDebugInfo {
    pub state: ControllerState,
    pub time: i64,
    pub current_turn: u32,
    pub pending_commands: usize,
    pub unsent_empty_turns: u32,
    pub outgoing: usize,
    pub commands_accepted: u64,
    pub duplicates_rejected: u64,
    pub turn_messages_sent: u64,
}

/// Authoritative turn clock.
///
/// Collects commands from every player and closes one turn per elapsed
/// `command_step_duration`. Closed turns are immutable and kept for resends.
#[derive(Debug)]
pub struct ServerLockstepController {
    config: LockstepConfig,
    server_config: LockstepServerConfig,
    state: ControllerState,
    time: i64,
    last_cmd_time: i64,
    history: Vec<Turn>,
    pending: Vec<TurnCommand>,
    seen: HashSet<(u8, u32)>,
    highest_ids: HashMap<u8, u32>,
    empty_run: Option<EmptyTurns>,
    outgoing: VecDeque<TurnMessage>,
    commands_accepted: u64,
    duplicates_rejected: u64,
    turn_messages_sent: u64,
}

impl ServerLockstepController {
    pub fn new(config: LockstepConfig, server_config: LockstepServerConfig) -> Self {
        Self {
            config,
            server_config,
            state: ControllerState::Idle,
            time: 0,
            last_cmd_time: 0,
            history: Vec::new(),
            pending: Vec::new(),
            seen: HashSet::new(),
            highest_ids: HashMap::new(),
            empty_run: None,
            outgoing: VecDeque::new(),
            commands_accepted: 0,
            duplicates_rejected: 0,
            turn_messages_sent: 0,
        }
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    pub fn server_config(&self) -> &LockstepServerConfig {
        &self.server_config
    }

    pub fn server_config_mut(&mut self) -> &mut LockstepServerConfig {
        &mut self.server_config
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    /// Number of the last closed turn.
    pub fn current_turn(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn turn(&self, number: u32) -> Option<&Turn> {
        number
            .checked_sub(1)
            .and_then(|index| self.history.get(index as usize))
    }

    pub fn start(&mut self, start_time_ms: i64) {
        if self.state != ControllerState::Idle {
            warn!("server start ignored while {}", self.state.as_str());
            return;
        }
        self.state = ControllerState::Running;
        self.time = start_time_ms;
        info!("server lockstep started at {}ms", start_time_ms);
    }

    pub fn pause(&mut self) {
        if self.state == ControllerState::Running {
            self.state = ControllerState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ControllerState::Paused {
            self.state = ControllerState::Running;
        }
    }

    /// Stops the clock and releases any held run of empty turns.
    pub fn stop(&mut self) {
        if self.state == ControllerState::Stopped {
            return;
        }
        self.flush_empty_run();
        self.state = ControllerState::Stopped;
        if !self.pending.is_empty() {
            debug!("dropping {} commands never assigned a turn", self.pending.len());
            self.pending.clear();
        }
        info!("server lockstep stopped after {} turns", self.current_turn());
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config, self.server_config.clone());
    }

    /// Buffers a command for the next turn. Commands are dropped when the
    /// server is not running or the `(player, id)` pair was already accepted.
    pub fn add_command(&mut self, command: TurnCommand) -> CommandAdmission {
        if !matches!(self.state, ControllerState::Running | ControllerState::Paused) {
            debug!(
                "rejecting command {} from player {} while {}",
                command.id,
                command.player,
                self.state.as_str()
            );
            return CommandAdmission::NotRunning;
        }
        if !self.seen.insert((command.player, command.id)) {
            self.duplicates_rejected += 1;
            debug!(
                "duplicate command {} from player {}",
                command.id, command.player
            );
            return CommandAdmission::Duplicate;
        }
        let highest = self.highest_ids.entry(command.player).or_default();
        *highest = (*highest).max(command.id);
        self.commands_accepted += 1;
        self.pending.push(command);
        CommandAdmission::Accepted
    }

    /// First command id `player` may use without colliding with commands
    /// already accepted from it. Handed to clients that take over a slot.
    pub fn next_command_id(&self, player: u8) -> u32 {
        self.highest_ids
            .get(&player)
            .map_or(1, |highest| highest.saturating_add(1))
    }

    /// Advances the clock by `dt_ms` and closes every elapsed turn. Returns
    /// the number of turns closed.
    pub fn update(&mut self, dt_ms: i64) -> u32 {
        if self.state != ControllerState::Running || dt_ms < 0 {
            return 0;
        }
        self.time += dt_ms;
        let step = self.config.command_step_duration.max(1) as i64;
        let mut closed = 0;
        while self.last_cmd_time + step <= self.time {
            self.last_cmd_time += step;
            self.close_turn();
            closed += 1;
        }
        closed
    }

    fn close_turn(&mut self) {
        let mut commands = std::mem::take(&mut self.pending);
        commands.sort_by_key(|c| (c.player, c.id));
        let turn = Turn::new(commands);
        self.history.push(turn.clone());
        let number = self.current_turn();

        if !self.server_config.allow_send_turn {
            // A held run must not reach past a turn that was never sent.
            self.flush_empty_run();
            return;
        }
        if turn.is_empty() {
            let batch = self
                .server_config
                .empty_turns_batch(self.config.command_step_duration);
            let run = self.empty_run.get_or_insert(EmptyTurns {
                first_turn: number,
                count: 0,
            });
            run.count += 1;
            if run.count >= batch {
                self.flush_empty_run();
            }
        } else {
            self.flush_empty_run();
            debug!("turn {} closed with {} commands", number, turn.len());
            self.push_outgoing(TurnMessage::Turn { number, turn });
        }
    }

    fn flush_empty_run(&mut self) {
        if let Some(run) = self.empty_run.take() {
            self.push_outgoing(TurnMessage::Empty(run));
        }
    }

    fn push_outgoing(&mut self, message: TurnMessage) {
        self.turn_messages_sent += 1;
        self.outgoing.push_back(message);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Drains turn messages produced since the last call, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<TurnMessage> {
        self.outgoing.drain(..).collect()
    }

    /// Closed turns from `first` onwards, compressed for a resend.
    pub fn turns_from(&self, first: u32) -> Vec<TurnMessage> {
        let first = first.max(1);
        let numbered = (first..=self.current_turn())
            .filter_map(|n| self.turn(n).map(|turn| (n, turn.clone())));
        compress_turns(numbered)
    }

    pub fn debug_info(&self) -> ServerDebugInfo {
        ServerDebugInfo {
            state: self.state,
            time: self.time,
            current_turn: self.current_turn(),
            pending_commands: self.pending.len(),
            unsent_empty_turns: self.empty_run.map_or(0, |run| run.count),
            outgoing: self.outgoing.len(),
            commands_accepted: self.commands_accepted,
            duplicates_rejected: self.duplicates_rejected,
            turn_messages_sent: self.turn_messages_sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(player: u8, id: u32) -> TurnCommand {
        TurnCommand {
            id,
            player,
            type_code: 1,
            payload: Vec::new(),
        }
    }

    fn running() -> ServerLockstepController {
        let mut server =
            ServerLockstepController::new(LockstepConfig::default(), LockstepServerConfig::default());
        server.start(0);
        server
    }

    #[test]
    fn idle_half_second_sends_one_empty_run() {
        let mut server = running();
        assert_eq!(server.update(500), 5);
        assert_eq!(
            server.take_outgoing(),
            vec![TurnMessage::Empty(EmptyTurns {
                first_turn: 1,
                count: 5
            })]
        );
    }

    #[test]
    fn empty_run_flushed_before_command_turn() {
        let mut server = running();
        server.update(200);
        assert!(!server.has_outgoing());
        server.add_command(command(0, 1));
        server.update(100);

        let out = server.take_outgoing();
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            TurnMessage::Empty(EmptyTurns {
                first_turn: 1,
                count: 2
            })
        );
        assert_eq!(out[1].first_turn(), 3);
    }

    #[test]
    fn commands_sorted_by_player_then_id() {
        let mut server = running();
        server.add_command(command(1, 1));
        server.add_command(command(0, 7));
        server.add_command(command(0, 2));
        server.update(100);

        let order = server
            .turn(1)
            .map(|t| t.commands.iter().map(|c| (c.player, c.id)).collect::<Vec<_>>());
        assert_eq!(order, Some(vec![(0, 2), (0, 7), (1, 1)]));
    }

    #[test]
    fn duplicates_and_idle_commands_rejected() {
        let mut idle =
            ServerLockstepController::new(LockstepConfig::default(), LockstepServerConfig::default());
        assert_eq!(idle.add_command(command(0, 1)), CommandAdmission::NotRunning);

        let mut server = running();
        assert_eq!(server.add_command(command(0, 1)), CommandAdmission::Accepted);
        server.update(100);
        assert_eq!(server.add_command(command(0, 1)), CommandAdmission::Duplicate);
        assert_eq!(server.add_command(command(1, 1)), CommandAdmission::Accepted);
        assert_eq!(server.debug_info().duplicates_rejected, 1);
        assert!(CommandAdmission::Duplicate.is_delivered());

        server.stop();
        assert_eq!(server.add_command(command(1, 2)), CommandAdmission::NotRunning);
        assert!(!CommandAdmission::NotRunning.is_delivered());
    }

    #[test]
    fn grace_period_closes_nothing() {
        let mut server =
            ServerLockstepController::new(LockstepConfig::default(), LockstepServerConfig::default());
        server.start(LockstepServerConfig::default().start_time());
        assert_eq!(server.update(1999), 0);
        assert_eq!(server.update(101), 1);
    }

    #[test]
    fn stop_releases_held_empty_turns() {
        let mut server = running();
        server.update(300);
        server.stop();
        assert_eq!(
            server.take_outgoing(),
            vec![TurnMessage::Empty(EmptyTurns {
                first_turn: 1,
                count: 3
            })]
        );
        assert_eq!(server.update(100), 0);
    }

    #[test]
    fn send_switch_off_still_records_history() {
        let mut server = running();
        server.server_config_mut().allow_send_turn = false;
        server.add_command(command(0, 1));
        server.update(700);
        server.stop();
        assert!(server.take_outgoing().is_empty());
        assert_eq!(server.current_turn(), 7);
        assert_eq!(server.turn(1).map(Turn::len), Some(1));
    }

    #[test]
    fn turns_from_compresses_history() {
        let mut server = running();
        server.update(200);
        server.add_command(command(0, 1));
        server.update(300);

        let resend = server.turns_from(2);
        assert_eq!(resend.len(), 3);
        assert_eq!(resend[0], TurnMessage::Empty(EmptyTurns { first_turn: 2, count: 1 }));
        assert_eq!(resend[1].first_turn(), 3);
        assert_eq!(resend[2], TurnMessage::Empty(EmptyTurns { first_turn: 4, count: 2 }));
        assert!(server.turns_from(6).is_empty());
    }

    #[test]
    fn pause_freezes_the_clock() {
        let mut server = running();
        server.pause();
        assert_eq!(server.update(500), 0);
        assert_eq!(server.add_command(command(0, 1)), CommandAdmission::Accepted);
        server.resume();
        assert_eq!(server.update(100), 1);
        assert_eq!(server.turn(1).map(Turn::len), Some(1));
    }

    #[test]
    fn next_command_id_follows_the_highest_accepted() {
        let mut server = running();
        assert_eq!(server.next_command_id(0), 1);
        server.add_command(command(0, 4));
        server.add_command(command(0, 2));
        server.add_command(command(1, 9));
        assert_eq!(server.next_command_id(0), 5);
        assert_eq!(server.next_command_id(1), 10);
        assert_eq!(server.next_command_id(2), 1);
    }

    #[test]
    fn empty_run_never_covers_an_unsent_turn() {
        let mut server = running();
        server.update(200);
        server.server_config_mut().allow_send_turn = false;
        server.add_command(command(0, 1));
        server.update(100);
        server.server_config_mut().allow_send_turn = true;
        server.update(300);
        server.stop();

        assert_eq!(server.turn(3).map(Turn::len), Some(1));
        assert_eq!(
            server.take_outgoing(),
            vec![
                TurnMessage::Empty(EmptyTurns {
                    first_turn: 1,
                    count: 2
                }),
                TurnMessage::Empty(EmptyTurns {
                    first_turn: 4,
                    count: 3
                }),
            ]
        );
    }
}
