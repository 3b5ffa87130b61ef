use std::path::PathBuf;

use clap::Args;

use lockstep::network::LinkConditions;
use lockstep::{LockstepConfig, LockstepServerConfig};

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(short, long, default_value_t = 2, help = "Simulated remote players")]
    pub players: u8,

    #[arg(long, help = "Host a player inside the server process")]
    pub local: bool,

    #[arg(short, long, default_value_t = 20, help = "Match length in seconds")]
    pub duration: u32,

    #[arg(long, default_value_t = 100, help = "Command step in ms")]
    pub step: u32,

    #[arg(long, default_value_t = 16, help = "Frame length in ms")]
    pub frame: u32,

    #[arg(long, default_value_t = 400, help = "Time between bot commands in ms")]
    pub command_interval: u32,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    pub loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    pub min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    pub max_latency: u32,

    #[arg(long, help = "Write the observed turn stream to this replay file")]
    pub record: Option<PathBuf>,

    #[arg(long, help = "Record turns on the server but never transmit them")]
    pub no_send_turn: bool,

    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lockstep: LockstepConfig,
    pub server: LockstepServerConfig,
    pub link: LinkConditions,
    pub remote_players: u8,
    pub local_player: bool,
    pub duration_ms: i64,
    pub frame_ms: i64,
    pub command_interval_ms: i64,
    pub record: Option<PathBuf>,
    pub seed: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lockstep: LockstepConfig::default(),
            server: LockstepServerConfig::default(),
            link: LinkConditions::default(),
            remote_players: 2,
            local_player: false,
            duration_ms: 20_000,
            frame_ms: 16,
            command_interval_ms: 400,
            record: None,
            seed: 1,
        }
    }
}

impl From<RunArgs> for SessionConfig {
    fn from(args: RunArgs) -> Self {
        let lockstep = LockstepConfig {
            command_step_duration: args.step.max(1),
            simulation_step_duration: args.step.max(1),
            ..Default::default()
        };
        let players = args.players.saturating_add(args.local as u8).max(1);
        let server = LockstepServerConfig {
            max_players: players,
            allow_send_turn: !args.no_send_turn,
            ..Default::default()
        };
        let link = LinkConditions {
            loss_percent: args.loss_percent.clamp(0.0, 100.0),
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency.max(args.min_latency),
            blocked: false,
        };
        Self {
            lockstep,
            server,
            link,
            remote_players: args.players,
            local_player: args.local,
            duration_ms: args.duration as i64 * 1000,
            frame_ms: args.frame.max(1) as i64,
            command_interval_ms: args.command_interval.max(1) as i64,
            record: args.record,
            seed: args.seed,
        }
    }
}
