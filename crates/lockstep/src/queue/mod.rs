mod command_queue;
mod packet;

pub use command_queue::{
    CommandHandle, CommandQueue, CommandQueueConfig, QueueCallback, QueueStats, RetryPolicy,
};
pub use packet::{CommandPacket, PacketTransport, SendStatus, UNACKED_PACKET_ID};

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::codec::{BinaryReader, BinaryWriter};
    use crate::command::{LockstepCommand, TurnCommand};
    use crate::error::{CodecError, QueueError, TransportError};

    #[derive(Debug, Clone, Default)]
    struct JoinMatch {
        match_id: String,
    }

    impl LockstepCommand for JoinMatch {
        fn type_code(&self) -> u8 {
            5
        }

        fn name(&self) -> &'static str {
            "join_match"
        }

        fn serialize(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
            w.write_string(&self.match_id)
        }

        fn deserialize(&mut self, r: &mut BinaryReader<'_>) -> Result<(), CodecError> {
            self.match_id = r.read_string()?;
            Ok(())
        }
    }

    fn join(id: u32) -> TurnCommand {
        TurnCommand::encode(
            id,
            0,
            &JoinMatch {
                match_id: "abc".into(),
            },
        )
        .unwrap()
    }

    fn running_queue() -> CommandQueue {
        let mut queue = CommandQueue::new(CommandQueueConfig::default());
        queue.start();
        queue
    }

    fn ok_transport() -> impl FnMut(&CommandPacket) -> SendStatus {
        |_: &CommandPacket| SendStatus::Delivered
    }

    fn failing_transport() -> impl FnMut(&CommandPacket) -> SendStatus {
        |_: &CommandPacket| SendStatus::Failed(TransportError::Disconnected)
    }

    fn assert_sync_invariant(queue: &CommandQueue) {
        assert_eq!(
            queue.synced(),
            queue.pending_count() == 0 && !queue.is_in_flight()
        );
    }

    #[test]
    fn flush_and_send_success_syncs() {
        let mut queue = running_queue();
        queue.add(join(1), None);
        assert!(!queue.synced());

        queue.flush(None);
        queue.send(&mut ok_transport(), None);

        assert!(queue.synced());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.stats().commands_acked, 1);
    }

    #[test]
    fn failed_send_keeps_command_pending() {
        let mut queue = running_queue();
        let result = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&result);
        queue.add(join(1), Some(Box::new(move |r| *seen.borrow_mut() = Some(r))));
        queue.flush(None);

        queue.send(&mut failing_transport(), None);
        assert!(!queue.synced());
        assert_eq!(queue.pending_count(), 1);
        assert!(result.borrow().is_none());

        queue.send(&mut ok_transport(), None);
        assert!(queue.synced());
        assert_eq!(*result.borrow(), Some(Ok(())));
    }

    #[test]
    fn retry_sends_the_same_packet() {
        let mut queue = running_queue();
        queue.add(join(1), None);
        queue.flush(None);
        queue.send(&mut failing_transport(), None);

        queue.add(join(2), None);
        queue.flush(None);

        let sent = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&sent);
        let mut transport = move |p: &CommandPacket| {
            log.borrow_mut()
                .push((p.id, p.commands.iter().map(|c| c.id).collect::<Vec<_>>()));
            SendStatus::Delivered
        };
        queue.send(&mut transport, None);
        queue.send(&mut transport, None);

        assert_eq!(*sent.borrow(), vec![(1, vec![1]), (2, vec![2])]);
        assert!(queue.synced());
    }

    #[test]
    fn sync_change_fires_on_transitions_only() {
        let mut queue = running_queue();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&changes);
        queue.on_sync_change(move |synced| log.borrow_mut().push(*synced));

        queue.add(join(1), None);
        queue.add(join(2), None);
        queue.flush(None);
        queue.send(&mut ok_transport(), None);

        assert_eq!(*changes.borrow(), vec![false, true]);
    }

    #[test]
    fn remove_cancels_unsent_commands() {
        let mut queue = running_queue();
        let cancelled = Rc::new(RefCell::new(0));
        for id in 1..=3 {
            let counter = Rc::clone(&cancelled);
            queue.add(
                join(id),
                Some(Box::new(move |r| {
                    if r == Err(QueueError::Cancelled) {
                        *counter.borrow_mut() += 1;
                    }
                })),
            );
        }
        queue.flush(None);
        queue.add(join(4), None);

        let removed = queue.remove(|c| c.id % 2 == 0);
        assert_eq!(removed, 2);
        assert_eq!(*cancelled.borrow(), 1);
        assert_eq!(
            queue.pending_commands().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_sync_invariant(&queue);

        assert_eq!(queue.remove(|_| true), 2);
        assert!(queue.synced());
    }

    #[test]
    fn in_flight_commands_cannot_be_removed() {
        let mut queue = running_queue();
        let handle = queue.add(join(1), None).unwrap();
        queue.flush(None);
        queue.send(&mut |_: &CommandPacket| SendStatus::Pending, None);

        assert!(queue.is_in_flight());
        assert!(!queue.cancel(handle));
        assert_eq!(queue.remove(|_| true), 0);
        assert_sync_invariant(&queue);

        queue.complete_send(1, Ok(()));
        assert!(queue.synced());
    }

    #[test]
    fn cancel_by_handle() {
        let mut queue = running_queue();
        let first = queue.add(join(1), None).unwrap();
        queue.add(join(2), None);
        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn flush_callback_runs_on_ack() {
        let mut queue = running_queue();
        let done = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&done);
        queue.add(join(1), None);
        queue.flush(Some(Box::new(move |r| *flag.borrow_mut() = r.is_ok())));
        assert!(!*done.borrow());

        queue.send(&mut |_: &CommandPacket| SendStatus::Pending, None);
        assert!(!*done.borrow());
        queue.complete_send(1, Ok(()));
        assert!(*done.borrow());
    }

    #[test]
    fn flush_with_nothing_pending_completes_immediately() {
        let mut queue = running_queue();
        let done = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&done);
        queue.flush(Some(Box::new(move |r| *seen.borrow_mut() = Some(r))));
        assert_eq!(*done.borrow(), Some(Ok(())));
    }

    #[test]
    fn send_while_in_flight_is_deferred() {
        let mut queue = running_queue();
        queue.add(join(1), None);
        queue.flush(None);
        queue.send(&mut |_: &CommandPacket| SendStatus::Pending, None);

        queue.add(join(2), None);
        queue.flush(None);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&sent);
        let mut transport = move |p: &CommandPacket| {
            log.borrow_mut().push(p.id);
            SendStatus::Delivered
        };
        queue.send(&mut transport, None);
        assert!(sent.borrow().is_empty());

        queue.complete_send(1, Ok(()));
        queue.update(0, &mut transport);
        assert_eq!(*sent.borrow(), vec![2]);
        assert!(queue.synced());
    }

    #[test]
    fn ack_timeout_counts_as_failure_and_retries() {
        let mut queue = CommandQueue::new(CommandQueueConfig {
            send_interval_ms: 0,
            retry: RetryPolicy {
                max_retries: 1,
                ack_timeout_ms: 100,
                backoff_factor: 1.1,
            },
        });
        queue.start();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&errors);
        queue.on_error(move |e| log.borrow_mut().push(e.clone()));

        queue.add(join(1), None);
        let mut silent = |_: &CommandPacket| SendStatus::Pending;
        // first update sends, later ones time out and resend
        queue.update(0, &mut silent);
        assert!(queue.is_in_flight());
        queue.update(100, &mut silent);
        queue.update(110, &mut silent);
        queue.update(121, &mut silent);

        assert_eq!(
            *errors.borrow(),
            vec![QueueError::RetriesExhausted {
                packet_id: 1,
                retries: 2
            }]
        );
        assert_eq!(queue.pending_count(), 1);
        assert!(!queue.synced());

        queue.complete_send(1, Ok(()));
        assert!(queue.synced());
    }

    #[test]
    fn not_running_finishes_immediately() {
        let mut queue = CommandQueue::new(CommandQueueConfig::default());
        let result = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&result);
        let handle = queue.add(join(1), Some(Box::new(move |r| *seen.borrow_mut() = Some(r))));
        assert!(handle.is_none());
        assert_eq!(*result.borrow(), Some(Err(QueueError::NotRunning)));
        assert!(queue.synced());
    }

    #[test]
    fn reset_discards_without_sending() {
        let mut queue = running_queue();
        let result = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&result);
        queue.add(join(1), Some(Box::new(move |r| *seen.borrow_mut() = Some(r))));
        queue.flush(None);
        queue.send(&mut failing_transport(), None);
        queue.add(join(2), None);

        queue.reset();
        assert!(queue.synced());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(*result.borrow(), Some(Err(QueueError::Reset)));
    }

    #[test]
    fn invariant_holds_across_mixed_operations() {
        let mut queue = running_queue();
        let mut flaky_calls = 0;
        let mut flaky = move |_: &CommandPacket| {
            flaky_calls += 1;
            if flaky_calls % 3 == 0 {
                SendStatus::Failed(TransportError::Disconnected)
            } else {
                SendStatus::Delivered
            }
        };
        for step in 0u32..40 {
            match step % 5 {
                0 | 1 => {
                    queue.add(join(step), None);
                }
                2 => {
                    queue.remove(|c| c.id == step - 1);
                }
                3 => queue.flush(None),
                _ => queue.send(&mut flaky, None),
            }
            assert_sync_invariant(&queue);
        }
        queue.flush(None);
        for _ in 0..10 {
            queue.send(&mut ok_transport(), None);
        }
        assert!(queue.synced());
    }

    #[test]
    fn packet_wire_format() {
        let packet = CommandPacket {
            id: 9,
            commands: vec![join(1)],
        };
        let mut w = BinaryWriter::new();
        packet.write(&mut w).unwrap();
        let read = CommandPacket::read(&mut BinaryReader::new(w.as_slice())).unwrap();
        assert_eq!(read, packet);
        assert!(read.needs_ack());
    }
}
