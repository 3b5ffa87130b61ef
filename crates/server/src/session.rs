use glam::Vec3;
use log::{debug, info, warn};

use lockstep::codec::Transform;
use lockstep::controller::TurnBufferStats;
use lockstep::network::{
    ClientPhase, LoopbackClient, LoopbackServer, MatchState, ServerEvent, ServerIncoming,
    ServerStats,
};
use lockstep::queue::QueueStats;
use lockstep::{
    BinaryReader, ClientLockstepController, CommandFactory, CommandQueueConfig,
    LockstepClientConfig, LockstepNetworkClient, LockstepNetworkServer, LoopbackHub,
    ProtocolError, ReplayLog, Simulation, fnv1a64,
};

use crate::config::SessionConfig;
use crate::game::{Arena, DeltaReport, MoveTo, Ping, command_factory};

/// Frames allowed for the finish handshake before the match is ended by force.
const FINISH_GRACE_FRAMES: u32 = 200;
/// Every n-th bot command is followed by a ping.
const PING_EVERY: u32 = 4;
const ARENA_HALF_SIZE: f32 = 20.0;

/// Deterministic target for the `counter`-th command of `actor`.
fn random_target(seed: u64, actor: usize, counter: u32) -> Vec3 {
    let mut bytes = [0u8; 20];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..16].copy_from_slice(&(actor as u64).to_le_bytes());
    bytes[16..].copy_from_slice(&counter.to_le_bytes());
    let hash = fnv1a64(&bytes);
    let unit = |bits: u64| (bits & 0xffff) as f32 / 65535.0 * 2.0 - 1.0;
    Vec3::new(unit(hash), 0.0, unit(hash >> 16)) * ARENA_HALF_SIZE
}

struct Bot {
    client: LockstepNetworkClient<LoopbackClient, Arena>,
    until_command_ms: i64,
    commands_sent: u32,
}

#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub name: String,
    pub player: u8,
    pub turn: u32,
    pub state_hash: u64,
    pub moves: u32,
    pub disconnects: u32,
    pub disconnect_time: i64,
    pub turn_buffer: TurnBufferStats,
    pub resync_requests: u32,
    pub queue: Option<QueueStats>,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub match_state: MatchState,
    pub server_turn: u32,
    pub server: ServerStats,
    pub duplicates_rejected: u64,
    pub clients: Vec<ClientSummary>,
    pub delta: DeltaReport,
}

impl Summary {
    /// True when every client reached the same turn with the same state.
    pub fn in_sync(&self) -> bool {
        let mut clients = self.clients.iter();
        let Some(first) = clients.next() else {
            return true;
        };
        clients.all(|c| c.turn == first.turn && c.state_hash == first.state_hash)
    }
}

/// One match hosted in-process: the server, an optional local player and a
/// set of bots connected through a loopback network.
pub struct Session {
    config: SessionConfig,
    hub: LoopbackHub,
    server: LockstepNetworkServer<LoopbackServer>,
    bots: Vec<Bot>,
    local: Option<ClientLockstepController<Arena>>,
    local_commands_sent: u32,
    until_local_command_ms: i64,
    recording: bool,
    elapsed_ms: i64,
    previous: Vec<Transform>,
    delta: DeltaReport,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, ProtocolError> {
        let factory = command_factory()?;
        let hub = LoopbackHub::new(config.seed);
        let mut server = LockstepNetworkServer::new(
            hub.server(),
            config.lockstep,
            config.server.clone(),
            config.seed,
        );

        let local = if config.local_player {
            match server.register_local_client("host") {
                Some(player) => {
                    info!("local player registered as {}", player);
                    Some(new_controller(&config, factory.clone()))
                }
                None => {
                    warn!("no slot left for the local player");
                    None
                }
            }
        } else {
            None
        };

        let bots = (0..config.remote_players)
            .map(|index| {
                let link = hub.connect();
                hub.set_conditions(link.id(), config.link);
                let mut client = LockstepNetworkClient::new(
                    link,
                    new_controller(&config, factory.clone()),
                    CommandQueueConfig::default(),
                    format!("bot-{index}"),
                );
                client.send_player_ready();
                Bot {
                    client,
                    until_command_ms: config.command_interval_ms,
                    commands_sent: 0,
                }
            })
            .collect();

        Ok(Self {
            until_local_command_ms: config.command_interval_ms,
            config,
            hub,
            server,
            bots,
            local,
            local_commands_sent: 0,
            recording: false,
            elapsed_ms: 0,
            previous: Vec::new(),
            delta: DeltaReport::default(),
        })
    }

    /// Runs the match for the configured duration, lets every player finish
    /// and returns the final statistics.
    pub fn run(&mut self) -> Summary {
        let frame = self.config.frame_ms;
        while self.elapsed_ms < self.config.duration_ms
            && self.server.match_state() != MatchState::Ended
        {
            self.step(frame);
            self.elapsed_ms += frame;
        }

        self.finish_players();
        let mut grace = 0;
        while self.server.match_state() != MatchState::Ended && grace < FINISH_GRACE_FRAMES {
            self.step(frame);
            grace += 1;
        }
        if self.server.match_state() != MatchState::Ended {
            warn!("players did not finish in time, ending match");
            self.server.end_match();
            self.step(0);
        }
        self.summary()
    }

    /// The observed turn stream, when recording was requested.
    pub fn take_replay(&mut self) -> Option<ReplayLog> {
        self.observer_mut()?.take_replay()
    }

    pub fn step(&mut self, dt: i64) {
        self.hub.advance(dt as u64);
        self.pump();
        if let Some(local) = self.local.as_mut() {
            if let Err(err) = self.server.exchange_with_local_client(local) {
                warn!("local client exchange failed: {}", err);
                local.stop();
            }
        }
        self.server.update(dt);
        for bot in &mut self.bots {
            bot.client.update(dt);
        }
        if let Some(local) = self.local.as_mut() {
            local.update(dt);
        }
        self.start_recording();
        self.issue_commands(dt);
        self.sample_delta();
        self.log_server_events();
        self.hub.advance(0);
        self.pump();
    }

    fn pump(&mut self) {
        for incoming in self.server.transport_mut().poll() {
            match incoming {
                ServerIncoming::Connected(client) => self.server.on_client_connected(client),
                ServerIncoming::Disconnected(client) => self.server.on_client_disconnected(client),
                ServerIncoming::Message {
                    client,
                    msg_type,
                    payload,
                } => {
                    let mut reader = BinaryReader::new(&payload);
                    if let Err(err) = self.server.on_message_received(client, msg_type, &mut reader)
                    {
                        warn!("bad message {} from client {}: {}", msg_type, client, err);
                    }
                }
            }
        }
        // Deliver the replies now so zero-latency bots start in the same frame
        // as the local player.
        self.hub.advance(0);
        for (index, bot) in self.bots.iter_mut().enumerate() {
            for frame in bot.client.transport_mut().poll() {
                let mut reader = BinaryReader::new(&frame.payload);
                if let Err(err) = bot.client.on_message_received(frame.msg_type, &mut reader) {
                    warn!("bad message {} for bot-{}: {}", frame.msg_type, index, err);
                }
            }
        }
    }

    fn observer(&self) -> Option<&ClientLockstepController<Arena>> {
        match &self.local {
            Some(local) => Some(local),
            None => self.bots.first().map(|bot| bot.client.controller()),
        }
    }

    fn observer_mut(&mut self) -> Option<&mut ClientLockstepController<Arena>> {
        match &mut self.local {
            Some(local) => Some(local),
            None => self.bots.first_mut().map(|bot| bot.client.controller_mut()),
        }
    }

    /// Starts recording once the observer knows its timing, before its first
    /// turn is applied.
    fn start_recording(&mut self) {
        if self.recording || self.config.record.is_none() {
            return;
        }
        let seed = self.config.seed;
        self.recording = match self.observer_mut() {
            Some(observer) if observer.is_running() && observer.current_turn() == 0 => {
                observer.start_recording(seed);
                debug!("recording turns from player {}", observer.player_number());
                true
            }
            _ => false,
        };
    }

    fn issue_commands(&mut self, dt: i64) {
        let seed = self.config.seed;
        let interval = self.config.command_interval_ms;
        for (index, bot) in self.bots.iter_mut().enumerate() {
            if bot.client.phase() != ClientPhase::Running {
                continue;
            }
            bot.until_command_ms -= dt;
            if bot.until_command_ms > 0 {
                continue;
            }
            bot.until_command_ms += interval;
            let target = random_target(seed, index, bot.commands_sent);
            bot.commands_sent += 1;
            bot.client.add_command(Box::new(MoveTo { target }), None);
            if bot.commands_sent % PING_EVERY == 0 {
                let sequence = (bot.commands_sent / PING_EVERY) as u16;
                bot.client.add_command(Box::new(Ping { sequence }), None);
            }
        }

        let actor = self.bots.len();
        let Some(local) = self.local.as_mut().filter(|l| l.is_running()) else {
            return;
        };
        self.until_local_command_ms -= dt;
        if self.until_local_command_ms > 0 {
            return;
        }
        self.until_local_command_ms += interval;
        let target = random_target(seed, actor, self.local_commands_sent);
        self.local_commands_sent += 1;
        local.add_pending_command(Box::new(MoveTo { target }), None);
    }

    fn sample_delta(&mut self) {
        let Some(current) = self.observer().map(|o| o.simulation().transforms()) else {
            return;
        };
        if current != self.previous {
            self.delta.sample(&self.previous, &current);
            self.previous = current;
        }
    }

    fn log_server_events(&mut self) {
        for event in self.server.drain_events() {
            match event {
                ServerEvent::PlayerRejected { client, reason } => {
                    warn!("client {} rejected: {}", client, reason)
                }
                ServerEvent::Resync { client, from_turn } => {
                    info!("client {} resynced from turn {}", client, from_turn)
                }
                ServerEvent::MatchEnded { turn, results } => {
                    info!("match ended at turn {} ({} results)", turn, results.len())
                }
                other => debug!("{:?}", other),
            }
        }
    }

    fn finish_players(&mut self) {
        for bot in &mut self.bots {
            let moves = bot.client.controller().simulation().moves();
            bot.client.send_player_finish(moves.to_le_bytes().to_vec());
        }
        if let Some(local) = &self.local {
            let moves = local.simulation().moves();
            self.server.local_player_finish(moves.to_le_bytes().to_vec());
        }
    }

    fn summary(&self) -> Summary {
        let mut clients = Vec::new();
        if let Some(local) = &self.local {
            clients.push(client_summary("host".to_owned(), local, 0, None));
        }
        for (index, bot) in self.bots.iter().enumerate() {
            clients.push(client_summary(
                format!("bot-{index}"),
                bot.client.controller(),
                bot.client.resync_requests(),
                Some(bot.client.queue_stats().clone()),
            ));
        }
        let server_info = self.server.controller().debug_info();
        Summary {
            match_state: self.server.match_state(),
            server_turn: server_info.current_turn,
            server: self.server.stats().clone(),
            duplicates_rejected: server_info.duplicates_rejected,
            clients,
            delta: self.delta,
        }
    }
}

fn new_controller(config: &SessionConfig, factory: CommandFactory) -> ClientLockstepController<Arena> {
    ClientLockstepController::new(
        config.lockstep,
        LockstepClientConfig::default(),
        factory,
        Arena::default(),
    )
}

fn client_summary(
    name: String,
    controller: &ClientLockstepController<Arena>,
    resync_requests: u32,
    queue: Option<QueueStats>,
) -> ClientSummary {
    let info = controller.debug_info();
    ClientSummary {
        name,
        player: info.player_number,
        turn: info.current_turn,
        state_hash: controller.simulation().state_hash(),
        moves: controller.simulation().moves(),
        disconnects: info.disconnects,
        disconnect_time: info.disconnect_time,
        turn_buffer: info.turn_buffer_stats,
        resync_requests,
        queue,
    }
}
