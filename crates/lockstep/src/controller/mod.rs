mod client;
mod server;

pub use client::{
    ClientDebugInfo, ClientLockstepController, CommandFinished, MAX_TURNS_AHEAD, TurnBufferStats,
};
pub use server::{CommandAdmission, ServerDebugInfo, ServerLockstepController};

use crate::command::ClientCommand;
use crate::error::CommandError;

/// Lifecycle shared by both controllers. `Stopped` is terminal until `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Paused => "paused",
            ControllerState::Stopped => "stopped",
        }
    }
}

/// How a client keeps up with the confirmed turn stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Normal,
    /// Missing more turns than tolerated. Counts as desynchronized.
    Waiting,
    /// Catching up after a late start or a capped frame.
    Recovering,
}

/// Deterministic game state driven by a client controller. Both methods must
/// be pure functions of the current state and their arguments.
pub trait Simulation {
    fn simulate(&mut self, step_ms: u32);

    fn apply_command(&mut self, command: &ClientCommand) -> Result<(), CommandError>;

    /// Digest of the full state, used to compare peers and replays.
    fn state_hash(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SimulationStarted,
    TurnApplied {
        turn: u32,
        commands: usize,
    },
    CommandFailed {
        turn: u32,
        command_id: u32,
        player: u8,
        error: CommandError,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::codec::{BinaryReader, BinaryWriter};
    use crate::command::{CommandFactory, LockstepCommand};
    use crate::config::{LockstepClientConfig, LockstepConfig};
    use crate::error::CodecError;
    use crate::hash::StateHasher;
    use crate::turn::{ClientTurn, EmptyTurns};

    #[derive(Debug, Clone, Default)]
    struct Add {
        amount: i32,
    }

    impl LockstepCommand for Add {
        fn type_code(&self) -> u8 {
            1
        }

        fn name(&self) -> &'static str {
            "add"
        }

        fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
            w.write_i32(self.amount);
            Ok(())
        }

        fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
            self.amount = r.read_i32()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        ticks: u32,
        total: i64,
    }

    impl Simulation for Counter {
        fn simulate(&mut self, _step_ms: u32) {
            self.ticks += 1;
        }

        fn apply_command(&mut self, command: &ClientCommand) -> Result<(), CommandError> {
            let add = command
                .command
                .downcast_ref::<Add>()
                .ok_or(CommandError::Unhandled(command.command.name()))?;
            if add.amount < 0 {
                return Err(CommandError::Rejected {
                    name: "add",
                    reason: "negative amount".into(),
                });
            }
            self.total += add.amount as i64;
            Ok(())
        }

        fn state_hash(&self) -> u64 {
            let mut hasher = StateHasher::new();
            hasher.write_u32(self.ticks);
            hasher.write_i64(self.total);
            hasher.finish()
        }
    }

    fn client() -> ClientLockstepController<Counter> {
        let factory = CommandFactory::new().with::<Add>().unwrap();
        ClientLockstepController::new(
            LockstepConfig::default(),
            LockstepClientConfig::default(),
            factory,
            Counter::default(),
        )
    }

    fn add_turn(id: u32, player: u8, amount: i32) -> ClientTurn {
        ClientTurn {
            commands: vec![ClientCommand {
                id,
                player,
                command: Box::new(Add { amount }),
            }],
        }
    }

    fn record_events(client: &mut ClientLockstepController<Counter>) -> Rc<RefCell<Vec<ClientEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&events);
        client.on_event(move |e| log.borrow_mut().push(e.clone()));
        events
    }

    #[test]
    fn local_command_lands_after_local_delay() {
        let mut client = client();
        client.start(0);
        let landed = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&landed);
        client.add_pending_command(
            Box::new(Add { amount: 3 }),
            Some(Box::new(move |r| *seen.borrow_mut() = Some(r))),
        );

        assert_eq!(client.update(1000), 10);
        assert_eq!(client.simulation().total, 0);
        assert!(landed.borrow().is_none());

        client.update(100);
        assert_eq!(client.simulation().total, 3);
        assert_eq!(*landed.borrow(), Some(Ok(11)));
        assert_eq!(client.simulation().ticks, 11);
    }

    #[test]
    fn start_delay_holds_the_first_step() {
        let mut client = client();
        let events = record_events(&mut client);
        client.start(-300);
        assert_eq!(client.update(300), 0);
        assert_eq!(*events.borrow(), vec![ClientEvent::SimulationStarted]);
        assert_eq!(client.update(100), 1);
    }

    #[test]
    fn networked_client_applies_only_confirmed_turns() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        client.add_confirmed_turn(1, add_turn(1, 1, 5));
        client.add_confirmed_empty_turns(EmptyTurns {
            first_turn: 2,
            count: 2,
        });

        assert_eq!(client.update(500), 3);
        assert_eq!(client.current_turn(), 3);
        assert_eq!(client.simulation().total, 5);
        assert_eq!(client.connection_state(), ConnectionState::Normal);
    }

    #[test]
    fn turns_apply_in_order_and_duplicates_are_dropped() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        assert!(client.add_confirmed_turn(2, add_turn(2, 1, 20)));
        assert_eq!(client.last_confirmed_turn(), 0);
        assert!(client.add_confirmed_turn(1, add_turn(1, 1, 1)));
        assert_eq!(client.last_confirmed_turn(), 2);
        assert!(!client.add_confirmed_turn(1, add_turn(9, 1, 100)));
        assert!(!client.add_confirmed_turn(2, add_turn(9, 1, 100)));

        client.update(200);
        assert_eq!(client.simulation().total, 21);
    }

    #[test]
    fn starving_client_waits_then_recovers() {
        let mut client = client();
        let events = record_events(&mut client);
        client.set_networked(true);
        client.start(0);

        client.update(1000);
        assert_eq!(client.connection_state(), ConnectionState::Normal);
        client.update(100);
        assert_eq!(client.connection_state(), ConnectionState::Waiting);
        assert!(!client.is_connected());
        assert_eq!(client.current_turn(), 0);

        client.add_confirmed_empty_turns(EmptyTurns {
            first_turn: 1,
            count: 12,
        });
        client.update(100);
        assert_eq!(client.current_turn(), 12);
        assert!(client.is_connected());

        let info = client.debug_info();
        assert_eq!(info.disconnects, 1);
        assert_eq!(info.disconnect_time, 100);
        let changes = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, ClientEvent::ConnectionChanged { .. }))
            .count();
        assert_eq!(changes, 2);
    }

    #[test]
    fn failed_command_reported_and_turn_still_applied() {
        let mut client = client();
        let events = record_events(&mut client);
        client.set_networked(true);
        client.start(0);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        let id = client
            .add_pending_command(
                Box::new(Add { amount: -1 }),
                Some(Box::new(move |r| *seen.borrow_mut() = Some(r))),
            )
            .unwrap();
        let staged = client.take_outgoing_commands();
        assert_eq!(staged.len(), 1);

        client.add_confirmed_turn(1, ClientTurn { commands: staged });
        client.update(100);

        assert!(matches!(*outcome.borrow(), Some(Err(CommandError::Rejected { .. }))));
        let events = events.borrow();
        assert!(events.contains(&ClientEvent::CommandFailed {
            turn: 1,
            command_id: id,
            player: 0,
            error: CommandError::Rejected {
                name: "add",
                reason: "negative amount".into(),
            },
        }));
        assert_eq!(
            events.last(),
            Some(&ClientEvent::TurnApplied {
                turn: 1,
                commands: 1
            })
        );
    }

    #[test]
    fn step_cap_bounds_catch_up() {
        let mut client = client();
        client.client_config_mut().max_simulation_steps_per_frame = 3;
        client.start(0);
        client.update(1000);
        assert_eq!(client.simulation().ticks, 3);
        assert_eq!(client.connection_state(), ConnectionState::Recovering);
        assert!(client.is_connected());
    }

    #[test]
    fn speed_factor_scales_time() {
        let mut client = client();
        client.client_config_mut().speed_factor = 2.0;
        client.start(0);
        assert_eq!(client.update(250), 5);
        assert_eq!(client.time(), 500);
    }

    #[test]
    fn stopped_client_fails_new_and_pending_commands() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        client.add_pending_command(
            Box::new(Add { amount: 1 }),
            Some(Box::new(move |r| *seen.borrow_mut() = Some(r))),
        );
        client.stop();
        assert_eq!(*outcome.borrow(), Some(Err(CommandError::NotRunning)));
        assert_eq!(client.add_pending_command(Box::new(Add { amount: 1 }), None), None);
        assert!(!client.add_confirmed_turn(1, ClientTurn::default()));

        client.reset();
        assert_eq!(client.state(), ControllerState::Idle);
        client.start(0);
        assert!(client.add_pending_command(Box::new(Add { amount: 1 }), None).is_some());
    }

    #[test]
    fn turn_buffer_stats_track_lead() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        client.add_confirmed_empty_turns(EmptyTurns {
            first_turn: 1,
            count: 4,
        });
        let stats = client.debug_info().turn_buffer_stats;
        assert_eq!(stats.lowest, Some(0));
        assert_eq!(stats.highest, Some(3));
        assert_eq!(stats.average(), Some(1));
        assert_eq!(client.turn_buffer(), 4);
    }

    #[test]
    fn reserved_ids_skip_past_earlier_commands() {
        let mut client = client();
        client.set_networked(true);
        client.reserve_command_ids(8);
        client.start(0);
        assert_eq!(client.add_pending_command(Box::new(Add { amount: 1 }), None), Some(8));
        client.reserve_command_ids(3);
        assert_eq!(client.next_command_id(), 9);
    }

    #[test]
    fn failing_a_pending_command_runs_its_callback() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        let id = client
            .add_pending_command(
                Box::new(Add { amount: 1 }),
                Some(Box::new(move |r| *seen.borrow_mut() = Some(r))),
            )
            .unwrap();

        let error = CommandError::Encode(CodecError::LengthOverflow(70_000));
        assert!(client.fail_pending_command(id, error.clone()));
        assert_eq!(*outcome.borrow(), Some(Err(error)));
        assert_eq!(client.pending_command_count(), 0);
        assert!(!client.fail_pending_command(id, CommandError::NotRunning));
    }

    #[test]
    fn turns_far_ahead_are_refused() {
        let mut client = client();
        client.set_networked(true);
        client.start(0);
        assert!(!client.add_confirmed_turn(u32::MAX, ClientTurn::default()));
        assert!(!client.add_confirmed_turn(1 + MAX_TURNS_AHEAD, ClientTurn::default()));
        assert!(client.add_confirmed_turn(MAX_TURNS_AHEAD, ClientTurn::default()));
        assert_eq!(client.debug_info().buffered_future_turns, 1);

        client.add_confirmed_empty_turns(EmptyTurns {
            first_turn: u32::MAX - 5,
            count: 6,
        });
        assert_eq!(client.debug_info().buffered_future_turns, 1);
        assert_eq!(client.last_confirmed_turn(), 0);
    }
}
