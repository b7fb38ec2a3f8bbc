//! Scripted Event Source
//!
//! Replays a timeline of named events against a [`ManualClock`]. Polls never
//! sleep: a poll that finds nothing advances the clock by its timeout, and a
//! poll that finds an event advances the clock to the event's time. This makes
//! waits deterministic, which the CLI and the tests rely on.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::clock::ManualClock;
use crate::error::{Result, ScriptError, WaiterError};
use crate::source::{EventSource, Polled};

/// An event scheduled at an offset from the clock origin
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedEvent {
    pub at: Duration,
    pub name: String,
    pub payload: Value,
}

impl ScriptedEvent {
    pub fn new(at: Duration, name: impl Into<String>, payload: Value) -> Self {
        Self {
            at,
            name: name.into(),
            payload,
        }
    }
}

/// A transport failure scheduled at an offset from the clock origin
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedFailure {
    pub at: Duration,
    pub message: String,
}

/// Event source driven by a script
pub struct ScriptedEventSource {
    clock: Arc<ManualClock>,
    max_poll: Duration,
    events: Mutex<VecDeque<ScriptedEvent>>,
    failure: Mutex<Option<ScriptedFailure>>,
    polls: AtomicUsize,
}

impl ScriptedEventSource {
    pub fn new(clock: Arc<ManualClock>, max_poll: Duration) -> Self {
        Self {
            clock,
            max_poll,
            events: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
            polls: AtomicUsize::new(0),
        }
    }

    /// Schedule events; the timeline is kept sorted by time
    pub fn with_events(self, events: impl IntoIterator<Item = ScriptedEvent>) -> Self {
        {
            let mut queue = self.events.lock();
            queue.extend(events);
            queue.make_contiguous().sort_by_key(|e| e.at);
        }
        self
    }

    /// Fail the poll whose window covers `at`
    pub fn with_failure(self, at: Duration, message: impl Into<String>) -> Self {
        *self.failure.lock() = Some(ScriptedFailure {
            at,
            message: message.into(),
        });
        self
    }

    /// Number of polls so far
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Events not handed out yet
    pub fn remaining(&self) -> usize {
        self.events.lock().len()
    }
}

impl EventSource for ScriptedEventSource {
    type Payload = Value;
    type Error = ScriptError;

    fn max_poll_duration(&self) -> Duration {
        self.max_poll
    }

    fn poll(&self, name: &str, timeout: Duration) -> std::result::Result<Polled<Value>, ScriptError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        let now = self.clock.elapsed();
        let window_end = now.saturating_add(timeout);

        let mut events = self.events.lock();
        let next = events
            .iter()
            .position(|e| e.name == name && e.at <= window_end);
        let event_at = next.map(|i| events[i].at);

        let mut failure = self.failure.lock();
        if let Some(fail) = failure.as_ref() {
            let fails_first = event_at.map_or(true, |at| fail.at < at);
            if fail.at <= window_end && fails_first {
                self.clock.advance_to(self.clock.origin() + fail.at);
                let message = fail.message.clone();
                *failure = None;
                return Err(ScriptError::Injected(message));
            }
        }

        match next.and_then(|i| events.remove(i)) {
            Some(event) => {
                self.clock.advance_to(self.clock.origin() + event.at);
                trace!("Scripted {} at {:?}", event.name, event.at);
                Ok(Polled::Event(event.payload))
            }
            None => {
                self.clock.advance(timeout);
                Ok(Polled::TimedOut)
            }
        }
    }
}

/// Scripted event as written in a scenario file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    pub at_ms: u64,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

/// Scripted failure as written in a scenario file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub at_ms: u64,
    pub message: String,
}

/// A wait to replay, loaded from TOML
///
/// ```toml
/// name = "bond after retry"
/// event = "onBondStateChanged"
/// timeout_ms = 5000
/// poll_quantum_ms = 2000
/// accept_after = 1
///
/// [[events]]
/// at_ms = 1000
/// name = "onBondStateChanged"
/// payload = { state = "bonding" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Event name to wait for
    pub event: String,
    /// Total wait budget; the configured default when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub poll_quantum_ms: u64,
    /// Matching events to reject before accepting one
    #[serde(default)]
    pub accept_after: usize,
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
    #[serde(default)]
    pub failure: Option<ScenarioFailure>,
}

impl Scenario {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents)?;
        if scenario.poll_quantum_ms == 0 {
            return Err(WaiterError::InvalidArgument(format!(
                "scenario {}: poll_quantum_ms must be positive",
                scenario.name
            )));
        }
        Ok(scenario)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    /// Wait budget, falling back to `default` when the file does not set one
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map_or(default, Duration::from_millis)
    }

    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    /// Build the source replaying this scenario on `clock`
    pub fn into_source(self, clock: Arc<ManualClock>) -> ScriptedEventSource {
        let quantum = self.poll_quantum();
        let events = self
            .events
            .into_iter()
            .map(|e| ScriptedEvent::new(Duration::from_millis(e.at_ms), e.name, e.payload));
        let source = ScriptedEventSource::new(clock, quantum).with_events(events);

        match self.failure {
            Some(f) => source.with_failure(Duration::from_millis(f.at_ms), f.message),
            None => source,
        }
    }
}
