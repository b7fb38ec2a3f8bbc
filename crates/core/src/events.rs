//! Event System
//!
//! Provides a pub/sub event bus for device callback events, and a
//! subscription that can be polled for named events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::WaitConfig;
use crate::error::SourceError;
use crate::source::{EventSource, Polled};

/// Ceiling for a single subscription poll, matching the default `wait.poll_quantum_ms`
pub const DEFAULT_MAX_POLL: Duration = Duration::from_secs(1);

/// Named callback event raised by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Callback name, e.g. `onBondStateChanged`
    pub name: String,
    /// Event data
    #[serde(default)]
    pub payload: Value,
}

impl DeviceEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Subscriber handle for receiving events.
///
/// Events are parked per name, so polling for one name never loses events
/// carrying another.
pub struct EventSubscription {
    receiver: Receiver<DeviceEvent>,
    pending: Mutex<HashMap<String, VecDeque<Value>>>,
    max_poll: Duration,
    _alive: Arc<()>,
}

impl EventSubscription {
    fn new(receiver: Receiver<DeviceEvent>, alive: Arc<()>) -> Self {
        Self {
            receiver,
            pending: Mutex::new(HashMap::new()),
            max_poll: DEFAULT_MAX_POLL,
            _alive: alive,
        }
    }

    /// Set the longest time a single poll may block
    pub fn with_max_poll(mut self, max_poll: Duration) -> Self {
        self.max_poll = max_poll;
        self
    }

    /// Take an already delivered event without blocking
    pub fn try_take(&self, name: &str) -> Option<Value> {
        self.drain_channel();
        self.take_parked(name)
    }

    /// Number of events called `name` that are ready to be taken
    pub fn pending_count(&self, name: &str) -> usize {
        self.drain_channel();
        self.pending.lock().get(name).map_or(0, VecDeque::len)
    }

    /// Drop everything received so far
    pub fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
        self.pending.lock().clear();
    }

    fn take_parked(&self, name: &str) -> Option<Value> {
        self.pending.lock().get_mut(name).and_then(VecDeque::pop_front)
    }

    fn park(&self, event: DeviceEvent) {
        trace!("Parking event {}", event.name);
        self.pending
            .lock()
            .entry(event.name)
            .or_default()
            .push_back(event.payload);
    }

    fn drain_channel(&self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.park(event);
        }
    }
}

impl EventSource for EventSubscription {
    type Payload = Value;
    type Error = SourceError;

    fn max_poll_duration(&self) -> Duration {
        self.max_poll
    }

    fn poll(&self, name: &str, timeout: Duration) -> Result<Polled<Value>, SourceError> {
        self.drain_channel();
        if let Some(payload) = self.take_parked(name) {
            return Ok(Polled::Event(payload));
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let received = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Polled::TimedOut);
                    }
                    self.receiver.recv_timeout(deadline - now)
                }
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(event) if event.name == name => return Ok(Polled::Event(event.payload)),
                Ok(event) => self.park(event),
                Err(RecvTimeoutError::Timeout) => return Ok(Polled::TimedOut),
                Err(RecvTimeoutError::Disconnected) => return Err(SourceError::Disconnected),
            }
        }
    }
}

struct Subscriber {
    sender: Sender<DeviceEvent>,
    alive: Arc<()>,
}

impl Subscriber {
    fn is_alive(&self) -> bool {
        Arc::strong_count(&self.alive) > 1
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        let alive = Arc::new(());
        self.subscribers.write().push(Subscriber {
            sender,
            alive: Arc::clone(&alive),
        });
        EventSubscription::new(receiver, alive)
    }

    /// Subscribe with the poll ceiling taken from `config`
    pub fn subscribe_with(&self, config: &WaitConfig) -> EventSubscription {
        self.subscribe().with_max_poll(config.poll_quantum())
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: DeviceEvent) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for subscriber in subscribers.iter().filter(|s| s.is_alive()) {
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        debug!("Event {} delivered to {} subscribers", event.name, delivered);
        delivered
    }

    /// Get the number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Forget subscribers whose subscription was dropped
    pub fn cleanup(&self) {
        self.subscribers.write().retain(Subscriber::is_alive);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
