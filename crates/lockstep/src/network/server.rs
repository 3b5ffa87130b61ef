use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, warn};

use super::transport::{ClientId, ServerTransport};
use crate::codec::BinaryReader;
use crate::config::{LockstepConfig, LockstepServerConfig};
use crate::controller::{ClientLockstepController, ControllerState, ServerLockstepController, Simulation};
use crate::error::ProtocolError;
use crate::protocol::LockstepMessage;
use crate::queue::CommandPacket;
use crate::turn::TurnMessage;

/// Id under which the in-process client is tracked. Never handed out by a
/// transport.
pub const LOCAL_CLIENT_ID: ClientId = ClientId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    WaitingForPlayers,
    Running,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected(ClientId),
    ClientDisconnected {
        client: ClientId,
        player: Option<u8>,
    },
    PlayerReady {
        client: ClientId,
        player: u8,
    },
    PlayerRejected {
        client: ClientId,
        reason: String,
    },
    Resync {
        client: ClientId,
        from_turn: u32,
    },
    /// Commands refused without an acknowledgement. The client keeps them
    /// queued and retries.
    CommandsDropped {
        client: ClientId,
        count: usize,
    },
    MatchStarted {
        players: u8,
    },
    PlayerFinished {
        player: u8,
    },
    MatchEnded {
        turn: u32,
        results: Vec<(u8, Vec<u8>)>,
    },
}

#[derive(Debug, Clone)]
struct PlayerSlot {
    token: String,
    client: Option<ClientId>,
    ready: bool,
    result: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
struct ClientData {
    player: Option<u8>,
    version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub commands_received: u64,
    pub resyncs: u64,
}

/// Runs a match over a [`ServerTransport`].
///
/// Tracks which connection holds which player slot, starts the server
/// controller once enough players are ready, relays finalized turns and ends
/// the match when every player has reported a result.
pub struct LockstepNetworkServer<T> {
    transport: T,
    controller: ServerLockstepController,
    seed: u64,
    clients: BTreeMap<ClientId, ClientData>,
    players: Vec<Option<PlayerSlot>>,
    match_state: MatchState,
    finish_elapsed: Option<i64>,
    local_turns: Vec<TurnMessage>,
    events: VecDeque<ServerEvent>,
    stats: ServerStats,
}

impl<T: ServerTransport> LockstepNetworkServer<T> {
    pub fn new(
        transport: T,
        config: LockstepConfig,
        server_config: LockstepServerConfig,
        seed: u64,
    ) -> Self {
        let slots = server_config.max_players as usize;
        Self {
            transport,
            controller: ServerLockstepController::new(config, server_config),
            seed,
            clients: BTreeMap::new(),
            players: vec![None; slots],
            match_state: MatchState::WaitingForPlayers,
            finish_elapsed: None,
            local_turns: Vec::new(),
            events: VecDeque::new(),
            stats: ServerStats::default(),
        }
    }

    pub fn controller(&self) -> &ServerLockstepController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ServerLockstepController {
        &mut self.controller
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn match_state(&self) -> MatchState {
        self.match_state
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn ready_count(&self) -> usize {
        self.players.iter().flatten().filter(|slot| slot.ready).count()
    }

    pub fn player_of(&self, client: ClientId) -> Option<u8> {
        self.clients.get(&client).and_then(|data| data.player)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.drain(..)
    }

    pub fn on_client_connected(&mut self, client: ClientId) {
        if self.clients.contains_key(&client) {
            debug!("client {} connected twice", client);
            return;
        }
        info!("client {} connected", client);
        self.clients.insert(client, ClientData::default());
        self.events.push_back(ServerEvent::ClientConnected(client));
        let setup = LockstepMessage::ClientSetup {
            config: *self.controller.config(),
            seed: self.seed,
        };
        self.send_to(client, &setup);
    }

    pub fn on_client_disconnected(&mut self, client: ClientId) {
        let Some(data) = self.clients.remove(&client) else {
            return;
        };
        info!("client {} disconnected (player {:?})", client, data.player);
        if let Some(player) = data.player {
            if let Some(slot) = self.slot_mut(player) {
                slot.ready = false;
                slot.client = None;
            }
            self.broadcast(&LockstepMessage::ClientConnectionStatus {
                player,
                connected: false,
            });
        }
        self.events.push_back(ServerEvent::ClientDisconnected {
            client,
            player: data.player,
        });

        if self.match_state == MatchState::Running {
            let finish_on_disconnect = self.controller.server_config().finish_on_client_disconnection;
            if finish_on_disconnect && self.ready_count() == 0 {
                info!("no ready players left, ending match");
                self.end_match();
            } else {
                self.check_all_finished();
            }
        }
    }

    /// Handles one message from `client`. Errors leave the server state
    /// untouched; the caller decides whether to drop the connection.
    pub fn on_message_received(
        &mut self,
        client: ClientId,
        msg_type: u8,
        r: &mut BinaryReader<'_>,
    ) -> Result<(), ProtocolError> {
        if !self.clients.contains_key(&client) {
            return Err(ProtocolError::UnknownClient(client));
        }
        let message = LockstepMessage::read(msg_type, r)?;
        self.stats.messages_received += 1;
        self.handle_message(client, message)
    }

    fn handle_message(
        &mut self,
        client: ClientId,
        message: LockstepMessage,
    ) -> Result<(), ProtocolError> {
        match message {
            LockstepMessage::Command(packet) => self.on_commands(client, packet),
            LockstepMessage::PlayerReady {
                player_token,
                current_turn,
                version,
            } => self.on_player_ready(client, player_token, current_turn, version),
            LockstepMessage::PlayerFinish { result } => self.on_player_finish(client, result),
            other => return Err(ProtocolError::UnexpectedMessage(other.message_type().code())),
        }
        Ok(())
    }

    fn on_commands(&mut self, client: ClientId, packet: CommandPacket) {
        let packet_id = packet.id;
        let needs_ack = packet.needs_ack();
        let count = packet.commands.len();
        let player = self.clients.get(&client).and_then(|data| data.player);
        let ready = player
            .and_then(|p| self.slot(p))
            .is_some_and(|slot| slot.ready);
        let Some(player) = player.filter(|_| ready) else {
            warn!(
                "dropping {} commands from client {} that is not ready",
                count, client
            );
            self.events.push_back(ServerEvent::CommandsDropped { client, count });
            return;
        };

        let mut delivered = true;
        for mut command in packet.commands {
            command.player = player;
            self.stats.commands_received += 1;
            delivered &= self.controller.add_command(command).is_delivered();
        }
        if !delivered {
            debug!(
                "match not running, {} commands from client {} left unacknowledged",
                count, client
            );
            self.events.push_back(ServerEvent::CommandsDropped { client, count });
            return;
        }
        if needs_ack {
            self.send_to(client, &LockstepMessage::CommandAck { packet_id });
        }
    }

    fn on_player_ready(&mut self, client: ClientId, token: String, current_turn: u32, version: u32) {
        if let Some(data) = self.clients.get_mut(&client) {
            if data.version != 0 && data.version != version {
                warn!(
                    "client {} changed protocol version {} -> {}",
                    client, data.version, version
                );
            }
            data.version = version;
        }
        let assigned = self.player_of(client);
        let already_ready = assigned
            .and_then(|p| self.slot(p))
            .is_some_and(|slot| slot.ready);

        if already_ready {
            if self.match_state == MatchState::Running {
                debug!(
                    "client {} asked for resync from turn {}",
                    client, current_turn
                );
                self.stats.resyncs += 1;
                self.send_start(client);
                self.resend_turns(client, current_turn.saturating_add(1));
            }
            return;
        }
        if self.match_state == MatchState::Ended {
            self.reject(client, "match has ended");
            return;
        }

        let Some(player) = self.claim_slot(client, &token) else {
            self.reject(client, "no free player slot");
            return;
        };
        if let Some(data) = self.clients.get_mut(&client) {
            data.player = Some(player);
        }
        info!("client {} ready as player {}", client, player);
        self.events.push_back(ServerEvent::PlayerReady { client, player });
        self.broadcast(&LockstepMessage::ClientConnectionStatus {
            player,
            connected: true,
        });

        match self.match_state {
            MatchState::Running => {
                self.send_start(client);
                self.resend_turns(client, current_turn.saturating_add(1));
            }
            _ => self.check_all_ready(),
        }
    }

    /// Reuses the slot of a returning token, otherwise takes the lowest free one.
    fn claim_slot(&mut self, client: ClientId, token: &str) -> Option<u8> {
        let running = self.match_state == MatchState::Running;
        let returning = self.players.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|s| s.client.is_none() && s.token == token)
        });
        // Slots left by other players stay reserved once the match runs.
        let index = returning.or_else(|| {
            self.players.iter().position(|slot| {
                slot.as_ref()
                    .is_none_or(|s| s.client.is_none() && !running)
            })
        })?;
        self.players[index] = Some(PlayerSlot {
            token: token.to_owned(),
            client: Some(client),
            ready: true,
            result: None,
        });
        Some(index as u8)
    }

    fn reject(&mut self, client: ClientId, reason: &str) {
        warn!("rejecting client {}: {}", client, reason);
        self.events.push_back(ServerEvent::PlayerRejected {
            client,
            reason: reason.to_owned(),
        });
    }

    fn check_all_ready(&mut self) {
        let ready = self.ready_count();
        let config = self.controller.server_config();
        let enough = ready == config.max_players as usize
            || (ready > 0 && config.allow_battle_start_with_one_player_ready);
        if enough {
            self.start_match();
        }
    }

    fn start_match(&mut self) {
        let start_time = self.controller.server_config().start_time();
        self.controller.start(start_time);
        self.match_state = MatchState::Running;
        let players = self.ready_count() as u8;
        info!("match started with {} players", players);
        self.events.push_back(ServerEvent::MatchStarted { players });
        let ready_clients = self
            .players
            .iter()
            .flatten()
            .filter(|slot| slot.ready)
            .filter_map(|slot| slot.client)
            .collect::<Vec<_>>();
        for client in ready_clients {
            self.send_start(client);
        }
    }

    fn send_start(&mut self, client: ClientId) {
        let Some(player_number) = self.player_of(client) else {
            return;
        };
        let start_time =
            self.controller.time() - self.controller.server_config().client_simulation_delay as i64;
        let message = LockstepMessage::ClientStart {
            server_timestamp: self.transport.timestamp(),
            start_time,
            player_count: self.players.iter().flatten().count() as u8,
            player_number,
            first_command_id: self.controller.next_command_id(player_number),
        };
        self.send_to(client, &message);
    }

    fn resend_turns(&mut self, client: ClientId, from_turn: u32) {
        if !self.controller.server_config().allow_send_turn {
            return;
        }
        let turns = self.controller.turns_from(from_turn);
        if turns.is_empty() {
            return;
        }
        debug!(
            "resending {} turn messages from {} to client {}",
            turns.len(),
            from_turn,
            client
        );
        self.events.push_back(ServerEvent::Resync { client, from_turn });
        for turn in turns {
            self.send_turn(client, turn);
        }
    }

    fn on_player_finish(&mut self, client: ClientId, result: Vec<u8>) {
        let Some(player) = self.player_of(client) else {
            warn!("finish from client {} without a player", client);
            return;
        };
        if self.match_state != MatchState::Running {
            return;
        }
        match self.slot_mut(player) {
            Some(slot) if slot.result.is_none() => slot.result = Some(result),
            _ => return,
        }
        info!("player {} finished", player);
        self.events.push_back(ServerEvent::PlayerFinished { player });
        if self.finish_elapsed.is_none() {
            self.finish_elapsed = Some(0);
        }
        self.check_all_finished();
    }

    fn check_all_finished(&mut self) {
        let ready = self.players.iter().flatten().filter(|s| s.ready);
        let (finished, total) = ready.fold((0, 0), |(f, t), slot| {
            (f + slot.result.is_some() as usize, t + 1)
        });
        if total > 0 && finished == total {
            self.end_match();
        }
    }

    /// Advances the match clock and relays the turns it closes.
    pub fn update(&mut self, dt_ms: i64) {
        if self.match_state != MatchState::Running {
            return;
        }
        self.controller.update(dt_ms);
        self.relay_turns();

        if let Some(elapsed) = self.finish_elapsed.as_mut() {
            *elapsed += dt_ms;
            let timeout = self
                .controller
                .server_config()
                .battle_ended_without_confirmation_timeout as i64
                * 1000;
            if *elapsed >= timeout {
                warn!("finish confirmation timed out, ending match");
                self.end_match();
            }
        }
    }

    fn relay_turns(&mut self) {
        let turns = self.controller.take_outgoing();
        for turn in turns {
            let recipients = self.ready_clients();
            for client in recipients {
                self.send_turn(client, turn.clone());
            }
        }
    }

    pub fn end_match(&mut self) {
        if self.match_state == MatchState::Ended {
            return;
        }
        self.controller.stop();
        self.relay_turns();
        self.match_state = MatchState::Ended;
        self.finish_elapsed = None;
        let results = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let result = slot.as_ref()?.result.clone()?;
                Some((index as u8, result))
            })
            .collect::<Vec<_>>();
        let turn = self.controller.current_turn();
        info!("match ended at turn {} with {} results", turn, results.len());
        self.broadcast(&LockstepMessage::ClientEnd {
            results: results.clone(),
        });
        self.events.push_back(ServerEvent::MatchEnded { turn, results });
    }

    /// Takes a player slot for the in-process client. Returns its player
    /// number, or `None` when every slot is taken.
    pub fn register_local_client(&mut self, token: &str) -> Option<u8> {
        if self.clients.contains_key(&LOCAL_CLIENT_ID) {
            return self.player_of(LOCAL_CLIENT_ID);
        }
        self.clients.insert(LOCAL_CLIENT_ID, ClientData::default());
        self.on_player_ready(LOCAL_CLIENT_ID, token.to_owned(), 0, 0);
        let player = self.player_of(LOCAL_CLIENT_ID);
        if player.is_none() {
            self.clients.remove(&LOCAL_CLIENT_ID);
        }
        player
    }

    pub fn unregister_local_client(&mut self) {
        self.local_turns.clear();
        self.on_client_disconnected(LOCAL_CLIENT_ID);
    }

    pub fn has_local_client(&self) -> bool {
        self.clients.contains_key(&LOCAL_CLIENT_ID)
    }

    pub fn local_player_finish(&mut self, result: Vec<u8>) {
        self.on_player_finish(LOCAL_CLIENT_ID, result);
    }

    /// Moves staged commands out of `client` and confirmed turns into it
    /// without going through the transport. Starts the client once the match
    /// is running and stops it when the match has ended.
    pub fn exchange_with_local_client<S: Simulation>(
        &mut self,
        client: &mut ClientLockstepController<S>,
    ) -> Result<(), ProtocolError> {
        let Some(player) = self.player_of(LOCAL_CLIENT_ID) else {
            return Ok(());
        };
        if client.state() == ControllerState::Idle && self.match_state == MatchState::Running {
            client.set_config(*self.controller.config());
            client.set_networked(true);
            client.set_player_number(player);
            client.reserve_command_ids(self.controller.next_command_id(player));
            let start_time =
                self.controller.time() - self.controller.server_config().client_simulation_delay as i64;
            client.start(start_time);
        }

        let commands = if client.client_config().allow_send_turn {
            client.take_outgoing_commands()
        } else {
            Vec::new()
        };
        if !commands.is_empty() {
            let mut wire = Vec::with_capacity(commands.len());
            for command in &commands {
                wire.push(command.to_wire()?);
            }
            self.on_commands(
                LOCAL_CLIENT_ID,
                CommandPacket {
                    id: crate::queue::UNACKED_PACKET_ID,
                    commands: wire,
                },
            );
        }

        for turn in std::mem::take(&mut self.local_turns) {
            client.receive_turns(&turn)?;
        }
        if self.match_state == MatchState::Ended {
            client.stop();
        }
        Ok(())
    }

    fn ready_clients(&self) -> Vec<ClientId> {
        self.players
            .iter()
            .flatten()
            .filter(|slot| slot.ready)
            .filter_map(|slot| slot.client)
            .collect()
    }

    fn slot(&self, player: u8) -> Option<&PlayerSlot> {
        self.players.get(player as usize).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, player: u8) -> Option<&mut PlayerSlot> {
        self.players.get_mut(player as usize).and_then(Option::as_mut)
    }

    fn send_turn(&mut self, client: ClientId, turn: TurnMessage) {
        if client == LOCAL_CLIENT_ID {
            self.local_turns.push(turn);
        } else {
            self.send_to(client, &LockstepMessage::from(turn));
        }
    }

    fn broadcast(&mut self, message: &LockstepMessage) {
        let clients = self.clients.keys().copied().collect::<Vec<_>>();
        for client in clients {
            self.send_to(client, message);
        }
    }

    fn send_to(&mut self, client: ClientId, message: &LockstepMessage) {
        // The local client reads turns and match state directly.
        if client == LOCAL_CLIENT_ID {
            return;
        }
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode {:?}: {}", message.message_type(), err);
                return;
            }
        };
        match self
            .transport
            .send(client, message.message_type().code(), &payload)
        {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += payload.len() as u64;
            }
            Err(err) => {
                self.stats.send_failures += 1;
                warn!(
                    "failed to send {:?} to client {}: {}",
                    message.message_type(),
                    client,
                    err
                );
            }
        }
    }
}
