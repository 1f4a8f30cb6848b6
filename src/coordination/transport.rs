//! Publish/subscribe transport boundary
//!
//! Delivery runs outside the tick loop and only ever touches an
//! [`InboundQueue`]; the loop drains that queue at a fixed point each tick.
//! [`InMemoryBroker`] is an in-process stand-in for the real broker with
//! at-least-once semantics, optional fault injection included.

use log::{trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::TransportError;

/// Bounded, thread-safe hand-off between transport delivery and the tick loop
///
/// The mutex guards only the queue itself. When full, the oldest payload is
/// dropped since newer telemetry supersedes it anyway.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    inner: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when an older payload had to be dropped to make room
    pub fn push(&self, payload: Vec<u8>) -> bool {
        let mut queue = self.lock();
        let mut kept_all = true;
        while queue.len() >= self.capacity {
            queue.pop_front();
            kept_all = false;
        }
        queue.push_back(payload);
        kept_all
    }

    /// Take everything queued so far, oldest first
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What a vehicle node needs from a publish/subscribe transport
pub trait Transport: Send {
    /// Fire-and-forget publish
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Deliver every message matching `filter` into `queue`
    fn subscribe(&mut self, filter: &str, queue: InboundQueue) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// MQTT-style topic matching: `+` matches one level, a trailing `#` the rest
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_filter(filter: &str) -> Result<(), TransportError> {
    let levels: Vec<&str> = filter.split('/').collect();
    let hash_misplaced = levels
        .iter()
        .enumerate()
        .any(|(i, level)| level.contains('#') && (*level != "#" || i + 1 != levels.len()));
    let plus_misplaced = levels.iter().any(|level| level.contains('+') && *level != "+");

    if filter.is_empty() || hash_misplaced || plus_misplaced {
        return Err(TransportError::InvalidTopic(filter.to_string()));
    }
    Ok(())
}

/// Delivery faults to simulate an imperfect at-least-once network
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaultProfile {
    /// Probability a message is delivered twice
    pub duplicate_rate: f64,
    /// Probability a message is held back and delivered after the next one
    pub delay_rate: f64,
    /// Probability a message is lost
    pub drop_rate: f64,
}

impl FaultProfile {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.duplicate_rate <= 0.0 && self.delay_rate <= 0.0 && self.drop_rate <= 0.0
    }
}

struct Subscription {
    filter: String,
    queue: InboundQueue,
}

struct BrokerState {
    online: bool,
    subscriptions: Vec<Subscription>,
    faults: FaultProfile,
    rng: StdRng,
    /// Messages held back by the delay fault, released on the next publish
    delayed: Vec<(String, Vec<u8>)>,
    published: u64,
    delivered: u64,
}

impl BrokerState {
    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        for subscription in &self.subscriptions {
            if topic_matches(&subscription.filter, topic) {
                if !subscription.queue.push(payload.to_vec()) {
                    warn!("Inbound queue full on {}, oldest message dropped", subscription.filter);
                }
                self.delivered += 1;
            }
        }
    }
}

/// In-process broker shared by every node of a simulated highway
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_faults(FaultProfile::none(), 0)
    }

    /// Broker injecting `faults`, with a seeded RNG for reproducible runs
    pub fn with_faults(faults: FaultProfile, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                subscriptions: Vec::new(),
                faults,
                rng: StdRng::seed_from_u64(seed),
                delayed: Vec::new(),
                published: 0,
                delivered: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the broker down or bring it back
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// A transport handle for one node
    pub fn connect(&self) -> BrokerTransport {
        BrokerTransport {
            broker: self.clone(),
        }
    }

    /// (published, delivered) message counts
    pub fn stats(&self) -> (u64, u64) {
        let state = self.lock();
        (state.published, state.delivered)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.online {
            return Err(TransportError::Unavailable("broker offline".to_string()));
        }

        state.published += 1;
        let faults = state.faults;

        if faults.is_clean() {
            state.deliver(topic, payload);
            return Ok(());
        }

        if state.rng.random_bool(faults.drop_rate.clamp(0.0, 1.0)) {
            trace!("Fault injection dropped message on {}", topic);
            return Ok(());
        }

        let held: Vec<(String, Vec<u8>)> = std::mem::take(&mut state.delayed);

        if state.rng.random_bool(faults.delay_rate.clamp(0.0, 1.0)) {
            trace!("Fault injection delayed message on {}", topic);
            state.delayed.push((topic.to_string(), payload.to_vec()));
        } else {
            state.deliver(topic, payload);
            if state.rng.random_bool(faults.duplicate_rate.clamp(0.0, 1.0)) {
                trace!("Fault injection duplicated message on {}", topic);
                state.deliver(topic, payload);
            }
        }

        // Held-back messages arrive after the newer one
        for (held_topic, held_payload) in held {
            state.deliver(&held_topic, &held_payload);
        }

        Ok(())
    }

    fn subscribe(&self, filter: &str, queue: InboundQueue) -> Result<(), TransportError> {
        validate_filter(filter)?;
        let mut state = self.lock();
        if !state.online {
            return Err(TransportError::Unavailable("broker offline".to_string()));
        }
        state.subscriptions.push(Subscription {
            filter: filter.to_string(),
            queue,
        });
        Ok(())
    }
}

/// A node's connection to an [`InMemoryBroker`]
#[derive(Clone)]
pub struct BrokerTransport {
    broker: InMemoryBroker,
}

impl Transport for BrokerTransport {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.broker.publish(topic, payload)
    }

    fn subscribe(&mut self, filter: &str, queue: InboundQueue) -> Result<(), TransportError> {
        self.broker.subscribe(filter, queue)
    }

    fn is_connected(&self) -> bool {
        self.broker.is_online()
    }
}
