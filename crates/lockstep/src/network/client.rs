use log::{debug, info, warn};

use super::transport::ClientTransport;
use crate::codec::{BinaryReader, BinaryWriter};
use crate::command::{CommandFlags, LockstepCommand, TurnCommand};
use crate::controller::{ClientLockstepController, CommandFinished, ConnectionState, Simulation};
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{LockstepMessage, MessageType, PROTOCOL_VERSION};
use crate::queue::{
    CommandPacket, CommandQueue, CommandQueueConfig, PacketTransport, QueueStats, SendStatus,
    UNACKED_PACKET_ID,
};

pub const DEFAULT_RESYNC_INTERVAL_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for `ClientSetup`.
    Connecting,
    SetUp,
    /// `PlayerReady` sent, waiting for `ClientStart`.
    Ready,
    Running,
    Ended,
    Failed,
}

/// Sends queue packets as `Command` messages. Acknowledgements arrive later
/// as `CommandAck`.
struct QueueLink<'a, T> {
    transport: &'a mut T,
}

impl<T: ClientTransport> PacketTransport for QueueLink<'_, T> {
    fn send_packet(&mut self, packet: &CommandPacket) -> SendStatus {
        let mut w = BinaryWriter::new();
        if let Err(err) = packet.write(&mut w) {
            return SendStatus::Failed(TransportError::Corrupt(err.to_string()));
        }
        match self.transport.send(MessageType::Command.code(), w.as_slice()) {
            Ok(()) => SendStatus::Pending,
            Err(err) => SendStatus::Failed(err),
        }
    }
}

/// Binds a client controller to a [`ClientTransport`].
///
/// Reliable commands go through a [`CommandQueue`] and are retried until the
/// server acknowledges them. Commands without [`CommandFlags::RELIABLE`] are
/// sent once in an unacknowledged packet.
pub struct LockstepNetworkClient<T, S> {
    transport: T,
    controller: ClientLockstepController<S>,
    queue: CommandQueue,
    player_token: String,
    phase: ClientPhase,
    ready_requested: bool,
    seed: Option<u64>,
    player_count: u8,
    held_unreliable: Vec<TurnCommand>,
    resync_interval_ms: i64,
    since_resync_ms: Option<i64>,
    resync_requests: u32,
    results: Option<Vec<(u8, Vec<u8>)>>,
    peers_connected: Vec<bool>,
}

impl<T: ClientTransport, S: Simulation> LockstepNetworkClient<T, S> {
    pub fn new(
        transport: T,
        mut controller: ClientLockstepController<S>,
        queue_config: CommandQueueConfig,
        player_token: impl Into<String>,
    ) -> Self {
        controller.set_networked(true);
        Self {
            transport,
            controller,
            queue: CommandQueue::new(queue_config),
            player_token: player_token.into(),
            phase: ClientPhase::Connecting,
            ready_requested: false,
            seed: None,
            player_count: 0,
            held_unreliable: Vec::new(),
            resync_interval_ms: DEFAULT_RESYNC_INTERVAL_MS,
            since_resync_ms: None,
            resync_requests: 0,
            results: None,
            peers_connected: Vec::new(),
        }
    }

    pub fn controller(&self) -> &ClientLockstepController<S> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ClientLockstepController<S> {
        &mut self.controller
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut CommandQueue {
        &mut self.queue
    }

    pub fn queue_stats(&self) -> &QueueStats {
        self.queue.stats()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn player_count(&self) -> u8 {
        self.player_count
    }

    pub fn resync_requests(&self) -> u32 {
        self.resync_requests
    }

    pub fn set_resync_interval(&mut self, interval_ms: i64) {
        self.resync_interval_ms = interval_ms.max(1);
    }

    /// Results broadcast with `ClientEnd`, once the match is over.
    pub fn results(&self) -> Option<&[(u8, Vec<u8>)]> {
        self.results.as_deref()
    }

    pub fn is_peer_connected(&self, player: u8) -> Option<bool> {
        self.peers_connected.get(player as usize).copied()
    }

    /// Announces this player. Held back until the server setup arrives.
    pub fn send_player_ready(&mut self) -> bool {
        if self.phase == ClientPhase::Connecting {
            self.ready_requested = true;
            return false;
        }
        if matches!(self.phase, ClientPhase::Ended | ClientPhase::Failed) {
            return false;
        }
        self.ready_requested = false;
        let message = LockstepMessage::PlayerReady {
            player_token: self.player_token.clone(),
            current_turn: self.controller.current_turn(),
            version: PROTOCOL_VERSION,
        };
        let sent = self.send(&message);
        if sent && self.phase == ClientPhase::SetUp {
            self.phase = ClientPhase::Ready;
        }
        sent
    }

    pub fn send_player_finish(&mut self, result: Vec<u8>) -> bool {
        if self.phase != ClientPhase::Running {
            return false;
        }
        self.send(&LockstepMessage::PlayerFinish { result })
    }

    pub fn add_command(
        &mut self,
        command: Box<dyn LockstepCommand>,
        finish: Option<CommandFinished>,
    ) -> Option<u32> {
        self.controller.add_pending_command(command, finish)
    }

    pub fn on_message_received(
        &mut self,
        msg_type: u8,
        r: &mut BinaryReader<'_>,
    ) -> Result<(), ProtocolError> {
        let result = LockstepMessage::read(msg_type, r).and_then(|message| self.handle(message));
        if let Err(err) = &result {
            warn!("lockstep client failed: {}", err);
            self.fail();
        }
        result
    }

    fn handle(&mut self, message: LockstepMessage) -> Result<(), ProtocolError> {
        let kind = message.message_type();
        if self.phase == ClientPhase::Connecting && kind != MessageType::ClientSetup {
            return Err(ProtocolError::NotSetUp {
                msg_type: kind.code(),
            });
        }
        match message {
            LockstepMessage::ClientSetup { config, seed } => {
                debug!("setup received: {:?}, seed {}", config, seed);
                self.controller.set_config(config);
                self.seed = Some(seed);
                if self.phase == ClientPhase::Connecting {
                    self.phase = ClientPhase::SetUp;
                }
                if self.ready_requested {
                    self.send_player_ready();
                }
            }
            LockstepMessage::ClientStart {
                server_timestamp,
                start_time,
                player_count,
                player_number,
                first_command_id,
            } => {
                self.controller.reserve_command_ids(first_command_id);
                self.on_start(server_timestamp, start_time, player_count, player_number);
            }
            LockstepMessage::Turn { number, turn } => {
                self.controller.add_confirmed_wire_turn(number, &turn)?;
            }
            LockstepMessage::EmptyTurns(empty) => self.controller.add_confirmed_empty_turns(empty),
            LockstepMessage::CommandAck { packet_id } => self.queue.complete_send(packet_id, Ok(())),
            LockstepMessage::ClientEnd { results } => {
                info!("match ended with {} results", results.len());
                self.results = Some(results);
                self.controller.stop();
                self.queue.stop();
                self.phase = ClientPhase::Ended;
            }
            LockstepMessage::ClientConnectionStatus { player, connected } => {
                let index = player as usize;
                if self.peers_connected.len() <= index {
                    self.peers_connected.resize(index + 1, false);
                }
                self.peers_connected[index] = connected;
                debug!("player {} connected: {}", player, connected);
            }
            other => return Err(ProtocolError::UnexpectedMessage(other.message_type().code())),
        }
        Ok(())
    }

    fn on_start(&mut self, server_timestamp: u64, start_time: i64, player_count: u8, player_number: u8) {
        self.player_count = player_count;
        if self.controller.is_running() {
            debug!("resync start received for player {}", player_number);
            return;
        }
        let start = start_time + self.transport.delay_since(server_timestamp);
        self.controller.set_player_number(player_number);
        self.controller.start(start);
        self.queue.start();
        self.phase = ClientPhase::Running;
        info!(
            "started as player {} of {} at {}ms",
            player_number, player_count, start
        );
    }

    fn fail(&mut self) {
        self.phase = ClientPhase::Failed;
        self.controller.stop();
        self.queue.stop();
    }

    /// Advances the controller and pushes staged commands to the server.
    pub fn update(&mut self, dt_ms: i64) -> u32 {
        let applied = self.controller.update(dt_ms);
        if self.phase != ClientPhase::Running {
            return applied;
        }

        // With sending disabled, commands stay staged in the controller.
        if self.controller.client_config().allow_send_turn {
            self.stage_commands();
            self.flush_unreliable();
            let mut link = QueueLink {
                transport: &mut self.transport,
            };
            self.queue.update(dt_ms.max(0) as u32, &mut link);
        }
        self.check_resync(dt_ms);
        applied
    }

    fn stage_commands(&mut self) {
        for command in self.controller.take_outgoing_commands() {
            let reliable = command.command.flags().contains(CommandFlags::RELIABLE);
            let wire = match command.to_wire() {
                Ok(wire) => wire,
                Err(err) => {
                    warn!("dropping command {}: {}", command.command.name(), err);
                    self.controller.fail_pending_command(command.id, err.into());
                    continue;
                }
            };
            if reliable {
                self.queue.add(wire, None);
            } else {
                self.held_unreliable.push(wire);
            }
        }
    }

    fn flush_unreliable(&mut self) {
        if self.held_unreliable.is_empty() {
            return;
        }
        let packet = CommandPacket {
            id: UNACKED_PACKET_ID,
            commands: std::mem::take(&mut self.held_unreliable),
        };
        let mut link = QueueLink {
            transport: &mut self.transport,
        };
        if let SendStatus::Failed(err) = link.send_packet(&packet) {
            warn!("unreliable commands lost: {}", err);
        }
    }

    /// While starved, asks the server to resend turns, once on entering
    /// `Waiting` and then every resync interval.
    fn check_resync(&mut self, dt_ms: i64) {
        if self.controller.connection_state() != ConnectionState::Waiting {
            self.since_resync_ms = None;
            return;
        }
        let due = match self.since_resync_ms.as_mut() {
            None => true,
            Some(elapsed) => {
                *elapsed += dt_ms;
                *elapsed >= self.resync_interval_ms
            }
        };
        if due {
            self.since_resync_ms = Some(0);
            self.resync_requests += 1;
            info!(
                "requesting resync from turn {}",
                self.controller.current_turn()
            );
            self.send_player_ready();
        }
    }

    fn send(&mut self, message: &LockstepMessage) -> bool {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode {:?}: {}", message.message_type(), err);
                return false;
            }
        };
        match self.transport.send(message.message_type().code(), &payload) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to send {:?}: {}", message.message_type(), err);
                false
            }
        }
    }
}
