use std::collections::VecDeque;
use std::fmt;

use log::{debug, warn};

use super::packet::{CommandPacket, PacketTransport, SendStatus};
use crate::command::TurnCommand;
use crate::error::{QueueError, TransportError};
use crate::event::Observers;

pub type QueueCallback = Box<dyn FnOnce(Result<(), QueueError>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before the session layer is notified.
    pub max_retries: u32,
    pub ack_timeout_ms: u32,
    pub backoff_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            ack_timeout_ms: 500,
            backoff_factor: 1.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommandQueueConfig {
    /// Batching window for `update`. Zero sends on every update.
    pub send_interval_ms: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub send_failures: u64,
    pub commands_acked: u64,
}

struct QueuedCommand {
    handle: CommandHandle,
    command: TurnCommand,
    finish: Option<QueueCallback>,
}

struct OutboundPacket {
    id: u32,
    commands: Vec<QueuedCommand>,
    flush_callbacks: Vec<QueueCallback>,
    retries: u32,
    exhausted_reported: bool,
}

impl OutboundPacket {
    fn to_packet(&self) -> CommandPacket {
        CommandPacket {
            id: self.id,
            commands: self.commands.iter().map(|c| c.command.clone()).collect(),
        }
    }

    fn resolve(self, result: Result<(), QueueError>) {
        for queued in self.commands {
            if let Some(finish) = queued.finish {
                finish(result.clone());
            }
        }
        for callback in self.flush_callbacks {
            callback(result.clone());
        }
    }
}

struct InFlight {
    elapsed_ms: u32,
    timeout_ms: u32,
    callbacks: Vec<QueueCallback>,
}

/// Client-side reliable outbound buffer.
///
/// Commands collect in an open batch until flushed into a packet. Packets are
/// sent one at a time; a failed packet stays at the head and is retried on the
/// next send cycle. Commands leave the queue only when their packet is
/// acknowledged or when they are removed before sending.
pub struct CommandQueue {
    config: CommandQueueConfig,
    running: bool,
    open: Vec<QueuedCommand>,
    sealed: VecDeque<OutboundPacket>,
    sending: Option<OutboundPacket>,
    in_flight: Option<InFlight>,
    deferred_send: bool,
    deferred_callbacks: Vec<QueueCallback>,
    next_packet_id: u32,
    next_handle: u64,
    timeout_ms: f32,
    since_send_ms: u32,
    synced: bool,
    sync_observers: Observers<bool>,
    error_observers: Observers<QueueError>,
    stats: QueueStats,
}

impl CommandQueue {
    pub fn new(config: CommandQueueConfig) -> Self {
        Self {
            config,
            running: false,
            open: Vec::new(),
            sealed: VecDeque::new(),
            sending: None,
            in_flight: None,
            deferred_send: false,
            deferred_callbacks: Vec::new(),
            next_packet_id: 1,
            next_handle: 1,
            timeout_ms: config.retry.ack_timeout_ms as f32,
            since_send_ms: 0,
            synced: true,
            sync_observers: Observers::new(),
            error_observers: Observers::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stops sending. Pending commands are kept.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Discards every pending command and packet without sending them.
    pub fn reset(&mut self) {
        let open = std::mem::take(&mut self.open);
        for queued in open {
            if let Some(finish) = queued.finish {
                finish(Err(QueueError::Reset));
            }
        }
        let sealed = std::mem::take(&mut self.sealed);
        for packet in sealed {
            packet.resolve(Err(QueueError::Reset));
        }
        if let Some(packet) = self.sending.take() {
            packet.resolve(Err(QueueError::Reset));
        }
        if let Some(flight) = self.in_flight.take() {
            for callback in flight.callbacks {
                callback(Err(QueueError::Reset));
            }
        }
        for callback in self.deferred_callbacks.drain(..) {
            callback(Err(QueueError::Reset));
        }
        self.deferred_send = false;
        self.since_send_ms = 0;
        self.timeout_ms = self.config.retry.ack_timeout_ms as f32;
        self.check_sync();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.open.len()
            + self.sealed.iter().map(|p| p.commands.len()).sum::<usize>()
            + self.sending.as_ref().map_or(0, |p| p.commands.len())
    }

    pub fn pending_commands(&self) -> impl Iterator<Item = &TurnCommand> {
        self.sending
            .iter()
            .chain(self.sealed.iter())
            .flat_map(|p| p.commands.iter())
            .chain(self.open.iter())
            .map(|q| &q.command)
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn on_sync_change<F>(&mut self, observer: F)
    where
        F: FnMut(&bool) + 'static,
    {
        self.sync_observers.subscribe(observer);
    }

    /// Notified when a packet exhausts the retry policy.
    pub fn on_error<F>(&mut self, observer: F)
    where
        F: FnMut(&QueueError) + 'static,
    {
        self.error_observers.subscribe(observer);
    }

    /// Queues `command`. When the queue is not running the command is finished
    /// right away with [`QueueError::NotRunning`].
    pub fn add(
        &mut self,
        command: TurnCommand,
        finish: Option<QueueCallback>,
    ) -> Option<CommandHandle> {
        if !self.running {
            if let Some(finish) = finish {
                finish(Err(QueueError::NotRunning));
            }
            return None;
        }
        let handle = CommandHandle(self.next_handle);
        self.next_handle += 1;
        self.open.push(QueuedCommand {
            handle,
            command,
            finish,
        });
        self.check_sync();
        Some(handle)
    }

    pub fn cancel(&mut self, handle: CommandHandle) -> bool {
        self.remove_where(|q| q.handle == handle) > 0
    }

    /// Cancels matching commands that have not been handed to the transport.
    pub fn remove<F>(&mut self, mut filter: F) -> usize
    where
        F: FnMut(&TurnCommand) -> bool,
    {
        self.remove_where(|q| filter(&q.command))
    }

    fn remove_where<F>(&mut self, mut filter: F) -> usize
    where
        F: FnMut(&QueuedCommand) -> bool,
    {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.open.len() {
            if filter(&self.open[i]) {
                removed.push(self.open.remove(i));
            } else {
                i += 1;
            }
        }
        for packet in &mut self.sealed {
            let mut i = 0;
            while i < packet.commands.len() {
                if filter(&packet.commands[i]) {
                    removed.push(packet.commands.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        let (emptied, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sealed)
            .into_iter()
            .partition(|p| p.commands.is_empty());
        self.sealed = kept.into();
        for packet in emptied {
            packet.resolve(Ok(()));
        }

        let count = removed.len();
        for queued in removed {
            if let Some(finish) = queued.finish {
                finish(Err(QueueError::Cancelled));
            }
        }
        if count > 0 {
            debug!("removed {} queued commands", count);
            self.check_sync();
        }
        count
    }

    /// Seals the open batch into a packet now. `callback` runs once every
    /// command queued so far has been acknowledged.
    pub fn flush(&mut self, callback: Option<QueueCallback>) {
        if !self.open.is_empty() {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
            self.sealed.push_back(OutboundPacket {
                id,
                commands: std::mem::take(&mut self.open),
                flush_callbacks: Vec::new(),
                retries: 0,
                exhausted_reported: false,
            });
        }
        let Some(callback) = callback else {
            return;
        };
        match self.sealed.back_mut().or(self.sending.as_mut()) {
            Some(packet) => packet.flush_callbacks.push(callback),
            None => callback(Ok(())),
        }
    }

    /// Transmits the head packet: a packet awaiting retry first, otherwise the
    /// oldest flushed one. Deferred while another packet is in flight.
    pub fn send<T>(&mut self, transport: &mut T, callback: Option<QueueCallback>)
    where
        T: PacketTransport + ?Sized,
    {
        self.send_with(transport, callback.into_iter().collect());
    }

    fn send_with<T>(&mut self, transport: &mut T, callbacks: Vec<QueueCallback>)
    where
        T: PacketTransport + ?Sized,
    {
        if !self.running {
            for callback in callbacks {
                callback(Err(QueueError::NotRunning));
            }
            return;
        }
        if self.in_flight.is_some() {
            self.deferred_send = true;
            self.deferred_callbacks.extend(callbacks);
            return;
        }
        if self.sending.is_none() {
            self.sending = self.sealed.pop_front();
        }
        let Some(outbound) = &self.sending else {
            for callback in callbacks {
                callback(Ok(()));
            }
            return;
        };

        let packet = outbound.to_packet();
        self.stats.packets_sent += 1;
        match transport.send_packet(&packet) {
            SendStatus::Delivered => self.finish_packet(Ok(()), callbacks),
            SendStatus::Pending => {
                self.in_flight = Some(InFlight {
                    elapsed_ms: 0,
                    timeout_ms: self.timeout_ms as u32,
                    callbacks,
                });
                self.check_sync();
            }
            SendStatus::Failed(err) => self.finish_packet(Err(err), callbacks),
        }
    }

    /// Reports the outcome of a packet that was sent with [`SendStatus::Pending`].
    /// Late acknowledgements of the current head packet are still accepted.
    pub fn complete_send(&mut self, packet_id: u32, result: Result<(), TransportError>) {
        let matches = self.sending.as_ref().is_some_and(|p| p.id == packet_id);
        if !matches {
            debug!("ignoring completion for stale packet {}", packet_id);
            return;
        }
        if result.is_err() && self.in_flight.is_none() {
            // Already counted as failed by the ack timeout.
            return;
        }
        let callbacks = self
            .in_flight
            .take()
            .map(|flight| flight.callbacks)
            .unwrap_or_default();
        self.finish_packet(result, callbacks);
    }

    /// Drives the batching window and ack timeouts.
    pub fn update<T>(&mut self, dt_ms: u32, transport: &mut T)
    where
        T: PacketTransport + ?Sized,
    {
        if !self.running {
            return;
        }

        let timed_out = self.in_flight.as_mut().and_then(|flight| {
            flight.elapsed_ms = flight.elapsed_ms.saturating_add(dt_ms);
            (flight.elapsed_ms >= flight.timeout_ms).then_some(())
        });
        if timed_out.is_some() {
            let id = self.sending.as_ref().map_or(0, |p| p.id);
            let callbacks = self
                .in_flight
                .take()
                .map(|flight| flight.callbacks)
                .unwrap_or_default();
            self.finish_packet(Err(TransportError::Timeout(id)), callbacks);
        }

        self.since_send_ms = self.since_send_ms.saturating_add(dt_ms);
        let window_elapsed = self.since_send_ms >= self.config.send_interval_ms;
        if (self.deferred_send || window_elapsed) && self.in_flight.is_none() {
            self.since_send_ms = 0;
            self.deferred_send = false;
            let deferred = std::mem::take(&mut self.deferred_callbacks);
            self.flush(None);
            self.send_with(transport, deferred);
        }
    }

    fn finish_packet(&mut self, result: Result<(), TransportError>, callbacks: Vec<QueueCallback>) {
        match result {
            Ok(()) => {
                if let Some(packet) = self.sending.take() {
                    self.stats.packets_acked += 1;
                    self.stats.commands_acked += packet.commands.len() as u64;
                    debug!(
                        "packet {} acknowledged with {} commands",
                        packet.id,
                        packet.commands.len()
                    );
                    packet.resolve(Ok(()));
                }
                self.timeout_ms = self.config.retry.ack_timeout_ms as f32;
                self.check_sync();
                for callback in callbacks {
                    callback(Ok(()));
                }
            }
            Err(err) => {
                self.stats.send_failures += 1;
                self.timeout_ms *= self.config.retry.backoff_factor;
                let mut exhausted = None;
                if let Some(packet) = self.sending.as_mut() {
                    packet.retries += 1;
                    warn!(
                        "packet {} failed (attempt {}): {}",
                        packet.id, packet.retries, err
                    );
                    if packet.retries > self.config.retry.max_retries && !packet.exhausted_reported {
                        packet.exhausted_reported = true;
                        exhausted = Some(QueueError::RetriesExhausted {
                            packet_id: packet.id,
                            retries: packet.retries,
                        });
                    }
                }
                self.check_sync();
                for callback in callbacks {
                    callback(Err(QueueError::Transport(err.clone())));
                }
                if let Some(error) = exhausted {
                    self.error_observers.emit(&error);
                }
            }
        }
    }

    fn check_sync(&mut self) {
        let synced = self.open.is_empty()
            && self.sealed.is_empty()
            && self.sending.is_none()
            && self.in_flight.is_none();
        if synced != self.synced {
            self.synced = synced;
            self.sync_observers.emit(&synced);
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("running", &self.running)
            .field("synced", &self.synced)
            .field("pending", &self.pending_count())
            .field("in_flight", &self.in_flight.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
