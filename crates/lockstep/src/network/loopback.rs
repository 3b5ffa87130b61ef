use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::rc::Rc;

use log::{debug, warn};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::transport::{ClientId, ClientTransport, ServerTransport};
use crate::error::TransportError;

/// What travels over a loopback link: the message type and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    fn to_bytes(&self) -> Result<AlignedVec, TransportError> {
        rkyv::to_bytes::<rancor::Error>(self).map_err(|e| TransportError::Corrupt(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        rkyv::from_bytes::<Self, rancor::Error>(bytes)
            .map_err(|e| TransportError::Corrupt(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkConditions {
    /// Chance in percent that a frame is dropped.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    /// Frames on a blocked link are held until it is unblocked.
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerIncoming {
    Connected(ClientId),
    Disconnected(ClientId),
    Message {
        client: ClientId,
        msg_type: u8,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Server,
    Client(ClientId),
}

#[derive(Debug)]
struct DelayedFrame {
    deliver_at: u64,
    sequence: u64,
    from: ClientId,
    to: Destination,
    bytes: AlignedVec,
}

impl PartialEq for DelayedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.sequence == other.sequence
    }
}

impl Eq for DelayedFrame {}

impl PartialOrd for DelayedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap. Equal times keep send order.
        other
            .deliver_at
            .cmp(&self.deliver_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
struct Link {
    conditions: LinkConditions,
    stats: LinkStats,
    held: Vec<DelayedFrame>,
    inbox: VecDeque<Frame>,
}

#[derive(Debug)]
struct HubState {
    now: u64,
    rng: u64,
    next_client: ClientId,
    next_sequence: u64,
    links: BTreeMap<ClientId, Link>,
    in_flight: BinaryHeap<DelayedFrame>,
    server_inbox: VecDeque<ServerIncoming>,
}

impl HubState {
    /// xorshift64*, so runs with the same seed drop the same frames.
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn random_percent(&mut self) -> f32 {
        (self.next_random() % 10_000) as f32 / 100.0
    }

    fn send(&mut self, client: ClientId, to: Destination, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.to_bytes()?;
        let Some(conditions) = self.links.get(&client).map(|link| link.conditions) else {
            return Err(TransportError::UnknownClient(client));
        };
        let dropped = conditions.loss_percent > 0.0 && self.random_percent() < conditions.loss_percent;
        let latency = self.latency(&conditions);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let delayed = DelayedFrame {
            deliver_at: self.now + latency,
            sequence,
            from: client,
            to,
            bytes,
        };

        let Some(link) = self.links.get_mut(&client) else {
            return Err(TransportError::UnknownClient(client));
        };
        link.stats.frames_sent += 1;
        link.stats.bytes_sent += frame.payload.len() as u64;
        if dropped {
            link.stats.frames_dropped += 1;
            debug!("loopback dropped frame {} on link {}", sequence, client);
        } else if conditions.blocked {
            link.held.push(delayed);
        } else {
            self.in_flight.push(delayed);
        }
        Ok(())
    }

    fn latency(&mut self, conditions: &LinkConditions) -> u64 {
        let min = conditions.min_latency_ms as u64;
        let range = (conditions.max_latency_ms as u64).saturating_sub(min);
        if range == 0 {
            min
        } else {
            min + self.next_random() % (range + 1)
        }
    }

    fn deliver_due(&mut self) {
        while self
            .in_flight
            .peek()
            .is_some_and(|frame| frame.deliver_at <= self.now)
        {
            let Some(delayed) = self.in_flight.pop() else {
                break;
            };
            let frame = match Frame::from_bytes(&delayed.bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("discarding corrupt loopback frame: {}", err);
                    continue;
                }
            };
            let Some(link) = self.links.get_mut(&delayed.from) else {
                // Link closed while the frame was in flight.
                continue;
            };
            link.stats.frames_delivered += 1;
            match delayed.to {
                Destination::Server => self.server_inbox.push_back(ServerIncoming::Message {
                    client: delayed.from,
                    msg_type: frame.msg_type,
                    payload: frame.payload,
                }),
                Destination::Client(_) => link.inbox.push_back(frame),
            }
        }
    }
}

/// In-memory network between one server and any number of clients, driven
/// by a virtual clock.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(HubState {
                now: 0,
                rng: seed.max(1),
                next_client: 1,
                next_sequence: 0,
                links: BTreeMap::new(),
                in_flight: BinaryHeap::new(),
                server_inbox: VecDeque::new(),
            })),
        }
    }

    pub fn server(&self) -> LoopbackServer {
        LoopbackServer {
            state: Rc::clone(&self.state),
        }
    }

    /// Opens a link. The server sees `Connected` on its next poll.
    pub fn connect(&self) -> LoopbackClient {
        let mut state = self.state.borrow_mut();
        let id = state.next_client;
        state.next_client += 1;
        state.links.insert(id, Link::default());
        state.server_inbox.push_back(ServerIncoming::Connected(id));
        LoopbackClient {
            id,
            state: Rc::clone(&self.state),
        }
    }

    /// Closes a link. Frames still in flight on it are lost.
    pub fn disconnect(&self, client: ClientId) {
        let mut state = self.state.borrow_mut();
        if state.links.remove(&client).is_some() {
            state.server_inbox.push_back(ServerIncoming::Disconnected(client));
        }
    }

    pub fn set_conditions(&self, client: ClientId, conditions: LinkConditions) {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let Some(link) = state.links.get_mut(&client) else {
            return;
        };
        let was_blocked = link.conditions.blocked;
        link.conditions = conditions;
        if was_blocked && !conditions.blocked {
            let now = state.now;
            for mut frame in link.held.drain(..) {
                frame.deliver_at = frame.deliver_at.max(now);
                state.in_flight.push(frame);
            }
        }
    }

    pub fn set_blocked(&self, client: ClientId, blocked: bool) {
        let conditions = self.conditions(client);
        if let Some(conditions) = conditions {
            self.set_conditions(client, LinkConditions { blocked, ..conditions });
        }
    }

    pub fn conditions(&self, client: ClientId) -> Option<LinkConditions> {
        self.state
            .borrow()
            .links
            .get(&client)
            .map(|link| link.conditions)
    }

    pub fn link_stats(&self, client: ClientId) -> Option<LinkStats> {
        self.state.borrow().links.get(&client).map(|link| link.stats)
    }

    pub fn now(&self) -> u64 {
        self.state.borrow().now
    }

    /// Moves the clock forward and delivers every frame that is due.
    pub fn advance(&self, dt_ms: u64) {
        let mut state = self.state.borrow_mut();
        state.now += dt_ms;
        state.deliver_due();
    }

    pub fn frames_in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }
}

#[derive(Debug)]
pub struct LoopbackServer {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackServer {
    pub fn poll(&mut self) -> Vec<ServerIncoming> {
        self.state.borrow_mut().server_inbox.drain(..).collect()
    }
}

impl ServerTransport for LoopbackServer {
    fn send(&mut self, client: ClientId, msg_type: u8, payload: &[u8]) -> Result<(), TransportError> {
        let frame = Frame {
            msg_type,
            payload: payload.to_vec(),
        };
        self.state
            .borrow_mut()
            .send(client, Destination::Client(client), &frame)
    }

    fn timestamp(&self) -> u64 {
        self.state.borrow().now
    }
}

#[derive(Debug)]
pub struct LoopbackClient {
    id: ClientId,
    state: Rc<RefCell<HubState>>,
}

impl LoopbackClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().links.contains_key(&self.id)
    }

    pub fn poll(&mut self) -> Vec<Frame> {
        self.state
            .borrow_mut()
            .links
            .get_mut(&self.id)
            .map(|link| link.inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

impl ClientTransport for LoopbackClient {
    fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), TransportError> {
        let frame = Frame {
            msg_type,
            payload: payload.to_vec(),
        };
        let mut state = self.state.borrow_mut();
        if !state.links.contains_key(&self.id) {
            return Err(TransportError::Disconnected);
        }
        state.send(self.id, Destination::Server, &frame)
    }

    fn delay_since(&self, server_timestamp: u64) -> i64 {
        self.state.borrow().now.saturating_sub(server_timestamp) as i64
    }
}
