mod config;
mod game;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};

use lockstep::{ClientLockstepController, LockstepClientConfig, ReplayLog, ReplayPlayer};

use config::{RunArgs, SessionConfig};
use game::{Arena, command_factory};
use session::{Session, Summary};

#[derive(Parser)]
#[command(name = "lockstep-server")]
#[command(about = "Headless lockstep session host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a match between bots and an optional local player.
    Run(RunArgs),
    /// Play a replay file twice and check that both runs end in the same state.
    Verify { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match cli.command {
        Command::Run(args) => run(args.into()),
        Command::Verify { path } => verify(&path),
    }
}

fn run(config: SessionConfig) -> Result<()> {
    if config.remote_players == 0 && !config.local_player {
        bail!("a match needs at least one player");
    }
    let record = config.record.clone();
    let mut session = Session::new(config).context("failed to set up the session")?;
    log::info!("session started");
    let summary = session.run();
    print_summary(&summary);

    if let Some(path) = record {
        let log = session
            .take_replay()
            .context("no turns were recorded")?;
        log.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!(
            "replay: {} turns, {} commands -> {}",
            log.len(),
            log.command_count(),
            path.display()
        );
    }

    ensure!(summary.in_sync(), "clients ended in different states");
    Ok(())
}

fn print_summary(summary: &Summary) {
    println!(
        "match {:?} at server turn {}",
        summary.match_state, summary.server_turn
    );
    let server = &summary.server;
    println!(
        "server: {} messages ({} bytes) sent, {} failed, {} commands, {} duplicates, {} resyncs",
        server.messages_sent,
        server.bytes_sent,
        server.send_failures,
        server.commands_received,
        summary.duplicates_rejected,
        server.resyncs
    );
    for client in &summary.clients {
        let buffer = &client.turn_buffer;
        println!(
            "{:>6} (player {}): turn {}, hash {:016x}, {} moves, buffer {:?}/{:?}/{:?}, {} stalls ({}ms), {} resync requests",
            client.name,
            client.player,
            client.turn,
            client.state_hash,
            client.moves,
            buffer.lowest,
            buffer.average(),
            buffer.highest,
            client.disconnects,
            client.disconnect_time,
            client.resync_requests
        );
        if let Some(queue) = &client.queue {
            println!(
                "        queue: {} packets, {} acked, {} commands acked, {} failures",
                queue.packets_sent, queue.packets_acked, queue.commands_acked, queue.send_failures
            );
        }
    }
    let delta = &summary.delta;
    println!(
        "codec: {} samples, {} bytes full, {} bytes as deltas ({:.1}%)",
        delta.samples,
        delta.full_bytes,
        delta.delta_bytes,
        delta.ratio() * 100.0
    );
}

fn verify(path: &Path) -> Result<()> {
    let log = ReplayLog::load(path).with_context(|| format!("failed to read {}", path.display()))?;
    let player = ReplayPlayer::new(log)?;
    let factory = command_factory()?;

    let mut hashes = Vec::with_capacity(2);
    for _ in 0..2 {
        let mut controller = ClientLockstepController::new(
            player.log().config,
            LockstepClientConfig::default(),
            factory.clone(),
            Arena::default(),
        );
        hashes.push(player.play(&mut controller)?);
    }
    ensure!(
        hashes[0] == hashes[1],
        "replay diverged: {:016x} != {:016x}",
        hashes[0],
        hashes[1]
    );
    println!(
        "replay ok: {} turns up to {}, seed {}, hash {:016x}",
        player.log().len(),
        player.last_turn(),
        player.log().seed,
        hashes[0]
    );
    Ok(())
}
