mod common;

use common::{Push, Wave, controller, factory};
use lockstep::{
    CommandFactory, LockstepConfig, ReplayError, ReplayLog, ReplayPlayer, Simulation, Turn,
    TurnCommand,
};

/// Plays a short local match while recording it.
fn recorded_match() -> (ReplayLog, u64) {
    let mut live = controller(factory());
    live.start_recording(77);
    live.start(0);
    live.add_pending_command(Box::new(Push { value: 2 }), None);
    live.add_pending_command(Box::new(Wave), None);
    for frame in 0..30 {
        if frame == 5 {
            live.add_pending_command(Box::new(Push { value: -6 }), None);
        }
        live.update(100);
    }
    assert_eq!(live.current_turn(), 30);
    assert_eq!(live.simulation().sum, -4);
    assert_eq!(live.simulation().waves, 1);
    let hash = live.simulation().state_hash();
    let log = live.take_replay().expect("recording was started");
    (log, hash)
}

#[test]
fn playback_reproduces_the_live_state() {
    let (log, live_hash) = recorded_match();
    assert_eq!(log.seed, 77);
    assert_eq!(log.last_turn(), Some(30));

    let player = ReplayPlayer::new(log).unwrap();
    let mut replayed = controller(factory());
    let hash = player.play(&mut replayed).unwrap();
    assert_eq!(hash, live_hash);
    assert_eq!(replayed.simulation().sum, -4);
    assert_eq!(replayed.current_turn(), 30);

    let mut again = controller(factory());
    assert_eq!(player.play(&mut again).unwrap(), hash);
}

#[test]
fn cosmetic_commands_are_not_recorded() {
    let (log, _) = recorded_match();
    assert_eq!(log.command_count(), 2);

    let mut replayed = controller(factory());
    ReplayPlayer::new(log).unwrap().play(&mut replayed).unwrap();
    assert_eq!(replayed.simulation().waves, 0);
}

#[test]
fn saved_replays_load_back() {
    let (log, live_hash) = recorded_match();
    let path = std::env::temp_dir().join(format!("lockstep-replay-{}.bin", std::process::id()));
    log.save(&path).unwrap();
    let loaded = ReplayLog::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.len(), log.len());
    assert_eq!(loaded.config, log.config);
    let mut replayed = controller(factory());
    let hash = ReplayPlayer::new(loaded).unwrap().play(&mut replayed).unwrap();
    assert_eq!(hash, live_hash);
}

#[test]
fn unknown_recorded_command_refuses_to_attach() {
    let mut log = ReplayLog::new(LockstepConfig::default(), 1);
    log.push(
        3,
        Turn::new(vec![TurnCommand {
            id: 1,
            player: 0,
            type_code: 9,
            payload: Vec::new(),
        }]),
    )
    .unwrap();

    let player = ReplayPlayer::new(log).unwrap();
    let mut replayed = controller(CommandFactory::new());
    let err = player.attach(&mut replayed).unwrap_err();
    assert!(matches!(err, ReplayError::Protocol(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let path = std::env::temp_dir().join("lockstep-replay-does-not-exist.bin");
    assert!(matches!(ReplayLog::load(&path), Err(ReplayError::Io(_))));
}
