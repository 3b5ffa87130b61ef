use std::collections::BTreeMap;

use log::{debug, info, warn};

use super::{ClientEvent, ConnectionState, ControllerState, Simulation};
use crate::command::{ClientCommand, CommandFactory, CommandFlags, LockstepCommand};
use crate::config::{LockstepClientConfig, LockstepConfig};
use crate::error::{CommandError, ProtocolError};
use crate::event::Observers;
use crate::replay::{ReplayLog, ReplayRecorder};
use crate::turn::{ClientTurn, EmptyTurns, Turn, TurnMessage};

/// Confirmed turns further than this ahead of the last confirmed one are
/// refused instead of buffered.
pub const MAX_TURNS_AHEAD: u32 = 1 << 16;

/// Called once a local command has been applied, with the turn it landed in.
pub type CommandFinished = Box<dyn FnOnce(Result<u32, CommandError>)>;

struct PendingCommand {
    id: u32,
    finish: Option<CommandFinished>,
}

/// Distribution of how many confirmed turns were buffered ahead of the
/// simulation when each turn arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnBufferStats {
    pub lowest: Option<u32>,
    pub highest: Option<u32>,
    sum: u64,
    samples: u64,
}

impl TurnBufferStats {
    fn record(&mut self, buffered: u32) {
        self.lowest = Some(self.lowest.map_or(buffered, |l| l.min(buffered)));
        self.highest = Some(self.highest.map_or(buffered, |h| h.max(buffered)));
        self.sum += buffered as u64;
        self.samples += 1;
    }

    pub fn average(&self) -> Option<u32> {
        (self.samples > 0).then(|| (self.sum / self.samples) as u32)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientDebugInfo {
    pub state: ControllerState,
    pub connection: ConnectionState,
    pub networked: bool,
    pub player_number: u8,
    pub time: i64,
    pub current_turn: u32,
    pub last_confirmed_turn: u32,
    pub turn_buffer: u32,
    pub turn_buffer_stats: TurnBufferStats,
    pub pending_commands: usize,
    pub buffered_future_turns: usize,
    pub disconnects: u32,
    pub disconnect_time: i64,
}

/// Client side of the lockstep.
///
/// Time advances through `update`. Simulation steps and command steps are
/// interleaved so that turn `n` is applied once the simulation reaches
/// `n * command_step_duration`. In networked mode a turn is applied only after
/// it has been confirmed; without a network every missing turn is empty.
pub struct ClientLockstepController<S> {
    config: LockstepConfig,
    client_config: LockstepClientConfig,
    factory: CommandFactory,
    simulation: S,
    state: ControllerState,
    connection: ConnectionState,
    networked: bool,
    player_number: u8,
    time: i64,
    last_sim_time: i64,
    last_cmd_time: i64,
    last_confirmed_turn: u32,
    confirmed_turns: BTreeMap<u32, ClientTurn>,
    future_turns: BTreeMap<u32, ClientTurn>,
    pending: Vec<PendingCommand>,
    outbox: Vec<ClientCommand>,
    next_command_id: u32,
    sim_started: bool,
    turn_buffer_stats: TurnBufferStats,
    disconnects: u32,
    disconnect_time: i64,
    recorder: Option<ReplayRecorder>,
    observers: Observers<ClientEvent>,
}

impl<S: Simulation> ClientLockstepController<S> {
    pub fn new(
        config: LockstepConfig,
        client_config: LockstepClientConfig,
        factory: CommandFactory,
        simulation: S,
    ) -> Self {
        Self {
            config,
            client_config,
            factory,
            simulation,
            state: ControllerState::Idle,
            connection: ConnectionState::Normal,
            networked: false,
            player_number: 0,
            time: 0,
            last_sim_time: 0,
            last_cmd_time: 0,
            last_confirmed_turn: 0,
            confirmed_turns: BTreeMap::new(),
            future_turns: BTreeMap::new(),
            pending: Vec::new(),
            outbox: Vec::new(),
            next_command_id: 1,
            sim_started: false,
            turn_buffer_stats: TurnBufferStats::default(),
            disconnects: 0,
            disconnect_time: 0,
            recorder: None,
            observers: Observers::new(),
        }
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// Replaces the shared timing. Ignored once the controller has started.
    pub fn set_config(&mut self, config: LockstepConfig) {
        if self.state == ControllerState::Idle {
            self.config = config;
        } else {
            warn!("ignoring lockstep config change while {}", self.state.as_str());
        }
    }

    pub fn client_config(&self) -> &LockstepClientConfig {
        &self.client_config
    }

    pub fn client_config_mut(&mut self) -> &mut LockstepClientConfig {
        &mut self.client_config
    }

    pub fn factory(&self) -> &CommandFactory {
        &self.factory
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    pub fn into_simulation(self) -> S {
        self.simulation
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection != ConnectionState::Waiting
    }

    pub fn is_networked(&self) -> bool {
        self.networked
    }

    /// Networked clients wait for confirmed turns and stage their commands
    /// for the server instead of confirming them locally.
    pub fn set_networked(&mut self, networked: bool) {
        self.networked = networked;
    }

    pub fn player_number(&self) -> u8 {
        self.player_number
    }

    pub fn set_player_number(&mut self, player_number: u8) {
        self.player_number = player_number;
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn current_turn(&self) -> u32 {
        self.config.turn_at(self.last_cmd_time)
    }

    pub fn last_confirmed_turn(&self) -> u32 {
        self.last_confirmed_turn
    }

    /// Confirmed turns not yet applied.
    pub fn turn_buffer(&self) -> u32 {
        self.last_confirmed_turn.saturating_sub(self.current_turn())
    }

    pub fn on_event<F>(&mut self, listener: F)
    where
        F: FnMut(&ClientEvent) + 'static,
    {
        self.observers.subscribe(listener);
    }

    /// Starts the clock at `start_time_ms`. Negative values delay the first
    /// step; positive values join a session already in progress.
    pub fn start(&mut self, start_time_ms: i64) {
        if self.state != ControllerState::Idle {
            warn!("start ignored while {}", self.state.as_str());
            return;
        }
        self.state = ControllerState::Running;
        self.time = start_time_ms;
        self.connection = if start_time_ms > 0 {
            ConnectionState::Recovering
        } else {
            ConnectionState::Normal
        };
        info!(
            "client lockstep started at {}ms as player {}{}",
            start_time_ms,
            self.player_number,
            if self.networked { "" } else { " (local)" }
        );
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

    pub fn stop(&mut self) {
        if self.state == ControllerState::Stopped {
            return;
        }
        self.state = ControllerState::Stopped;
        self.fail_pending();
        self.outbox.clear();
        info!(
            "client lockstep stopped at turn {} (confirmed {})",
            self.current_turn(),
            self.last_confirmed_turn
        );
    }

    /// Clears all turn state and returns to `Idle`. The simulation is kept as
    /// is; pass a fresh one through `simulation_mut` if needed.
    pub fn reset(&mut self) {
        self.fail_pending();
        self.state = ControllerState::Idle;
        self.connection = ConnectionState::Normal;
        self.time = 0;
        self.last_sim_time = 0;
        self.last_cmd_time = 0;
        self.last_confirmed_turn = 0;
        self.confirmed_turns.clear();
        self.future_turns.clear();
        self.outbox.clear();
        self.next_command_id = 1;
        self.sim_started = false;
        self.turn_buffer_stats = TurnBufferStats::default();
        self.disconnects = 0;
        self.disconnect_time = 0;
        self.recorder = None;
    }

    fn fail_pending(&mut self) {
        for pending in self.pending.drain(..) {
            if let Some(finish) = pending.finish {
                finish(Err(CommandError::NotRunning));
            }
        }
    }

    /// Records every applied turn from now on. `seed` is stored with the log.
    pub fn start_recording(&mut self, seed: u64) {
        self.recorder = Some(ReplayRecorder::new(self.config, seed));
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn take_replay(&mut self) -> Option<ReplayLog> {
        self.recorder.take().map(ReplayRecorder::finish)
    }

    /// Submits a local command. Returns its id, or `None` when the controller
    /// is not running, in which case `finish` has already been called.
    pub fn add_pending_command(
        &mut self,
        command: Box<dyn LockstepCommand>,
        finish: Option<CommandFinished>,
    ) -> Option<u32> {
        if self.state != ControllerState::Running {
            if let Some(finish) = finish {
                finish(Err(CommandError::NotRunning));
            }
            return None;
        }
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        let client_command = ClientCommand {
            id,
            player: self.player_number,
            command,
        };
        self.pending.push(PendingCommand { id, finish });
        if self.networked {
            self.outbox.push(client_command);
        } else {
            self.add_local_command(client_command);
        }
        Some(id)
    }

    /// Without a server, commands land `local_simulation_delay` after the
    /// last applied turn.
    fn add_local_command(&mut self, command: ClientCommand) {
        let step = self.config.command_step_duration.max(1) as i64;
        let delay = self.client_config.local_simulation_delay.max(0) as i64;
        let turn = 1 + ((self.last_cmd_time + delay) / step) as u32;
        self.confirmed_turns
            .entry(turn)
            .or_default()
            .commands
            .push(command);
        self.last_confirmed_turn = self.last_confirmed_turn.max(turn);
    }

    /// Makes the next local command id at least `first`.
    pub fn reserve_command_ids(&mut self, first: u32) {
        self.next_command_id = self.next_command_id.max(first);
    }

    pub fn next_command_id(&self) -> u32 {
        self.next_command_id
    }

    /// Resolves a pending local command that will never reach a turn.
    pub fn fail_pending_command(&mut self, id: u32, error: CommandError) -> bool {
        let Some(pos) = self.pending.iter().position(|p| p.id == id) else {
            return false;
        };
        let pending = self.pending.remove(pos);
        debug!("pending command {} failed: {}", id, error);
        if let Some(finish) = pending.finish {
            finish(Err(error));
        }
        true
    }

    /// Commands waiting to be sent to the server.
    pub fn take_outgoing_commands(&mut self) -> Vec<ClientCommand> {
        std::mem::take(&mut self.outbox)
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending.len()
    }

    /// Accepts a confirmed turn. Stale or duplicate numbers are discarded and
    /// turns ahead of the sequence are held until the gap is filled.
    pub fn add_confirmed_turn(&mut self, number: u32, turn: ClientTurn) -> bool {
        if self.state == ControllerState::Stopped {
            return false;
        }
        let Some(next) = self.last_confirmed_turn.checked_add(1) else {
            return false;
        };
        if number < next || self.future_turns.contains_key(&number) {
            debug!("discarding duplicate turn {}", number);
            return false;
        }
        if number - next >= MAX_TURNS_AHEAD {
            warn!(
                "discarding turn {}, too far ahead of confirmed turn {}",
                number, self.last_confirmed_turn
            );
            return false;
        }
        if number > next {
            self.future_turns.insert(number, turn);
            return true;
        }
        self.confirm(number, turn);
        loop {
            let Some(next) = self.last_confirmed_turn.checked_add(1) else {
                break;
            };
            let Some(turn) = self.future_turns.remove(&next) else {
                break;
            };
            self.confirm(next, turn);
        }
        true
    }

    pub fn add_confirmed_empty_turns(&mut self, empty: EmptyTurns) {
        let first = empty.first_turn.max(self.last_confirmed_turn.saturating_add(1));
        let horizon = self.last_confirmed_turn.saturating_add(MAX_TURNS_AHEAD);
        let last = empty.last_turn().min(horizon);
        if empty.count == 0 || first > last {
            return;
        }
        for number in first..=last {
            self.add_confirmed_turn(number, ClientTurn::default());
        }
    }

    /// Decodes a wire turn with this client's factory and confirms it.
    pub fn add_confirmed_wire_turn(&mut self, number: u32, turn: &Turn) -> Result<bool, ProtocolError> {
        let decoded = turn.decode(&self.factory)?;
        Ok(self.add_confirmed_turn(number, decoded))
    }

    pub fn receive_turns(&mut self, message: &TurnMessage) -> Result<(), ProtocolError> {
        match message {
            TurnMessage::Turn { number, turn } => {
                self.add_confirmed_wire_turn(*number, turn)?;
            }
            TurnMessage::Empty(empty) => self.add_confirmed_empty_turns(*empty),
        }
        Ok(())
    }

    fn confirm(&mut self, number: u32, turn: ClientTurn) {
        let buffered = self.turn_buffer();
        self.turn_buffer_stats.record(buffered);
        self.last_confirmed_turn = number;
        if !turn.is_empty() {
            self.confirmed_turns.insert(number, turn);
        }
    }

    /// Advances the clock by `dt_ms` scaled by the speed factor. Returns the
    /// number of turns applied.
    pub fn update(&mut self, dt_ms: i64) -> u32 {
        if self.state != ControllerState::Running || dt_ms < 0 {
            return 0;
        }
        let dt = (self.client_config.speed_factor as f64 * dt_ms as f64).round() as i64;
        self.time += dt;
        if !self.sim_started && self.time >= 0 {
            self.sim_started = true;
            self.observers.emit(&ClientEvent::SimulationStarted);
        }

        let was_connected = self.is_connected();
        self.connection = ConnectionState::Normal;
        let sim_step = self.config.simulation_step_duration.max(1) as i64;
        let cmd_step = self.config.command_step_duration.max(1) as i64;
        let max_steps = self.client_config.max_simulation_steps_per_frame;
        let mut sim_steps = 0u32;
        let mut applied = 0u32;

        loop {
            let next_sim = self.last_sim_time + sim_step;
            let next_cmd = self.last_cmd_time + cmd_step;
            if next_sim <= next_cmd && next_sim <= self.time {
                self.simulation.simulate(sim_step as u32);
                self.last_sim_time = next_sim;
                sim_steps += 1;
                if max_steps > 0 && sim_steps >= max_steps {
                    self.connection = ConnectionState::Recovering;
                    break;
                }
            } else if next_cmd <= self.time {
                let number = self.current_turn() + 1;
                if self.last_confirmed_turn >= number || !self.networked {
                    let turn = self.confirmed_turns.remove(&number).unwrap_or_default();
                    self.process_turn(number, turn);
                    self.last_cmd_time = next_cmd;
                    applied += 1;
                } else {
                    // Turns the clock has passed without a confirmation.
                    let missing = self
                        .config
                        .turn_at(self.time)
                        .saturating_sub(self.last_confirmed_turn);
                    if missing > self.config.max_skipped_empty_turns {
                        self.connection = ConnectionState::Waiting;
                    }
                    break;
                }
            } else {
                break;
            }
        }

        if self.connection == ConnectionState::Waiting {
            self.disconnect_time += dt;
        }
        if was_connected != self.is_connected() {
            if self.connection == ConnectionState::Waiting {
                self.disconnects += 1;
                warn!(
                    "client desynchronized at turn {}, last confirmed {}",
                    self.current_turn(),
                    self.last_confirmed_turn
                );
            } else {
                info!("client resynchronized at turn {}", self.current_turn());
            }
            let state = self.connection;
            self.observers.emit(&ClientEvent::ConnectionChanged { state });
        }
        applied
    }

    fn process_turn(&mut self, number: u32, turn: ClientTurn) {
        if let Some(recorder) = self.recorder.as_mut() {
            let recorded = turn
                .commands
                .iter()
                .filter(|c| c.command.flags().contains(CommandFlags::AFFECTS_SIMULATION))
                .map(ClientCommand::to_wire)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())
                .and_then(|commands| {
                    recorder
                        .record(number, Turn::new(commands))
                        .map_err(|e| e.to_string())
                });
            if let Err(err) = recorded {
                warn!("stopping replay recording at turn {}: {}", number, err);
                self.recorder = None;
            }
        }

        for command in &turn.commands {
            let result = self.simulation.apply_command(command);
            if let Err(error) = &result {
                warn!(
                    "command {} ({}) from player {} failed in turn {}: {}",
                    command.id,
                    command.command.name(),
                    command.player,
                    number,
                    error
                );
                self.observers.emit(&ClientEvent::CommandFailed {
                    turn: number,
                    command_id: command.id,
                    player: command.player,
                    error: error.clone(),
                });
            }
            if command.player == self.player_number {
                if let Some(pos) = self.pending.iter().position(|p| p.id == command.id) {
                    let pending = self.pending.remove(pos);
                    if let Some(finish) = pending.finish {
                        finish(result.map(|_| number));
                    }
                }
            }
        }
        self.observers.emit(&ClientEvent::TurnApplied {
            turn: number,
            commands: turn.commands.len(),
        });
    }

    pub fn debug_info(&self) -> ClientDebugInfo {
        ClientDebugInfo {
            state: self.state,
            connection: self.connection,
            networked: self.networked,
            player_number: self.player_number,
            time: self.time,
            current_turn: self.current_turn(),
            last_confirmed_turn: self.last_confirmed_turn,
            turn_buffer: self.turn_buffer(),
            turn_buffer_stats: self.turn_buffer_stats,
            pending_commands: self.pending.len(),
            buffered_future_turns: self.future_turns.len(),
            disconnects: self.disconnects,
            disconnect_time: self.disconnect_time,
        }
    }
}
