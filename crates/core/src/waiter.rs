//! Bounded Event Waiter
//!
//! Chains bounded polls against an [`EventSource`] to wait for a named event
//! for longer than the source allows a single poll to block, while reporting
//! progress to the caller after every expired poll.
//!
//! ```text
//! Polling --timeout / rejected event--> Polling
//! Polling --accepted event-----------> Matched   (terminal)
//! Polling --deadline reached---------> GivenUp   (terminal)
//! ```

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::WaitConfig;
use crate::error::WaitError;
use crate::source::{EventSource, Polled};

/// An event observed during a wait
#[derive(Debug, Clone, PartialEq)]
pub struct Event<P> {
    payload: P,
    elapsed: Duration,
}

impl<P> Event<P> {
    pub fn new(payload: P, elapsed: Duration) -> Self {
        Self { payload, elapsed }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Time since the wait started when the event was observed
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Terminal result of a wait
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<P> {
    /// The callbacks accepted an event
    Matched { event: Event<P>, elapsed: Duration },
    /// The deadline passed without an accepted event
    GivenUp { elapsed: Duration },
}

impl<P> WaitOutcome<P> {
    pub fn is_matched(&self) -> bool {
        matches!(self, WaitOutcome::Matched { .. })
    }

    /// Time spent inside the wait
    pub fn elapsed(&self) -> Duration {
        match self {
            WaitOutcome::Matched { elapsed, .. } | WaitOutcome::GivenUp { elapsed } => *elapsed,
        }
    }

    pub fn event(&self) -> Option<&Event<P>> {
        match self {
            WaitOutcome::Matched { event, .. } => Some(event),
            WaitOutcome::GivenUp { .. } => None,
        }
    }

    pub fn into_event(self) -> Option<Event<P>> {
        match self {
            WaitOutcome::Matched { event, .. } => Some(event),
            WaitOutcome::GivenUp { .. } => None,
        }
    }
}

/// Hooks invoked by [`BoundedEventWaiter::wait`]
pub trait WaitCallbacks<P> {
    /// An event arrived. Return `true` to accept it and stop waiting,
    /// `false` to treat it as noise and keep polling.
    fn on_received(&mut self, _event: &Event<P>, _elapsed: Duration) -> bool {
        true
    }

    /// A poll expired without an event
    fn on_waiting(&mut self, _elapsed: Duration) {}

    /// The deadline passed. Called at most once per wait.
    fn on_missed(&mut self) {}
}

/// Accepts the first event and ignores progress
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptFirst;

impl<P> WaitCallbacks<P> for AcceptFirst {}

type ReceivedFn<'a, P> = Box<dyn FnMut(&Event<P>, Duration) -> bool + 'a>;
type WaitingFn<'a> = Box<dyn FnMut(Duration) + 'a>;
type MissedFn<'a> = Box<dyn FnMut() + 'a>;

/// Closure based [`WaitCallbacks`]
///
/// ```
/// use droid_waiter_core::waiter::Callbacks;
///
/// let mut waited = 0;
/// let callbacks = Callbacks::<u32>::new()
///     .on_received(|event, _| *event.payload() == 7)
///     .on_waiting(|_| waited += 1);
/// # drop(callbacks);
/// ```
pub struct Callbacks<'a, P> {
    received: Option<ReceivedFn<'a, P>>,
    waiting: Option<WaitingFn<'a>>,
    missed: Option<MissedFn<'a>>,
}

impl<'a, P> Callbacks<'a, P> {
    pub fn new() -> Self {
        Self {
            received: None,
            waiting: None,
            missed: None,
        }
    }

    pub fn on_received(mut self, f: impl FnMut(&Event<P>, Duration) -> bool + 'a) -> Self {
        self.received = Some(Box::new(f));
        self
    }

    pub fn on_waiting(mut self, f: impl FnMut(Duration) + 'a) -> Self {
        self.waiting = Some(Box::new(f));
        self
    }

    pub fn on_missed(mut self, f: impl FnMut() + 'a) -> Self {
        self.missed = Some(Box::new(f));
        self
    }
}

impl<P> Default for Callbacks<'_, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> WaitCallbacks<P> for Callbacks<'_, P> {
    fn on_received(&mut self, event: &Event<P>, elapsed: Duration) -> bool {
        match self.received.as_mut() {
            Some(f) => f(event, elapsed),
            None => true,
        }
    }

    fn on_waiting(&mut self, elapsed: Duration) {
        if let Some(f) = self.waiting.as_mut() {
            f(elapsed);
        }
    }

    fn on_missed(&mut self) {
        if let Some(f) = self.missed.as_mut() {
            f();
        }
    }
}

struct Filter<F>(F);

impl<P, F: FnMut(&P) -> bool> WaitCallbacks<P> for Filter<F> {
    fn on_received(&mut self, event: &Event<P>, _elapsed: Duration) -> bool {
        (self.0)(event.payload())
    }
}

/// Waits for named events without ever blocking past a deadline.
///
/// The waiter keeps no state between calls. Every call derives its own
/// deadline, and each poll is capped at the smaller of the source's
/// [`max_poll_duration`](EventSource::max_poll_duration) and the optional
/// quantum set on the waiter, so a wait overruns its budget by at most one
/// poll quantum.
#[derive(Debug, Clone)]
pub struct BoundedEventWaiter<C = SystemClock> {
    clock: C,
    poll_quantum: Option<Duration>,
    log_progress: bool,
}

impl BoundedEventWaiter<SystemClock> {
    /// Create a waiter on the wall clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create a wall clock waiter from configuration
    pub fn from_config(config: &WaitConfig) -> Self {
        Self::new()
            .with_poll_quantum(config.poll_quantum())
            .with_progress_logging(config.log_progress)
    }
}

impl Default for BoundedEventWaiter<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> BoundedEventWaiter<C> {
    /// Create a waiter reading time from `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            poll_quantum: None,
            log_progress: false,
        }
    }

    /// Cap every poll at `quantum`, in addition to the source's own ceiling
    pub fn with_poll_quantum(mut self, quantum: Duration) -> Self {
        self.poll_quantum = Some(quantum);
        self
    }

    /// Log each expired poll at info level instead of trace
    pub fn with_progress_logging(mut self, enabled: bool) -> Self {
        self.log_progress = enabled;
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Effective poll quantum against `source`
    pub fn poll_quantum_for<S: EventSource + ?Sized>(&self, source: &S) -> Duration {
        let ceiling = source.max_poll_duration();
        match self.poll_quantum {
            Some(quantum) => quantum.min(ceiling),
            None => ceiling,
        }
    }

    /// Wait until `callbacks` accept an event called `name`, or until
    /// `total_timeout` has passed.
    ///
    /// Fails with [`WaitError::InvalidArgument`] before polling if `name` is
    /// empty, `total_timeout` is zero, or the effective poll quantum is zero.
    /// Any error from the source ends the wait and is returned as
    /// [`WaitError::Source`].
    pub fn wait<S, F>(
        &self,
        source: &S,
        name: &str,
        total_timeout: Duration,
        callbacks: &mut F,
    ) -> Result<WaitOutcome<S::Payload>, WaitError<S::Error>>
    where
        S: EventSource + ?Sized,
        F: WaitCallbacks<S::Payload> + ?Sized,
    {
        if name.is_empty() {
            return Err(WaitError::InvalidArgument("event name must not be empty".into()));
        }
        if total_timeout.is_zero() {
            return Err(WaitError::InvalidArgument(format!(
                "timeout for {} must be positive",
                name
            )));
        }
        let quantum = self.poll_quantum_for(source);
        if quantum.is_zero() {
            return Err(WaitError::InvalidArgument(format!(
                "poll quantum for {} must be positive",
                name
            )));
        }

        let start = self.clock.now();
        // `None` when the budget runs past what `Instant` can represent
        let deadline = start.checked_add(total_timeout);
        debug!("Waiting up to {:?} for {} (poll quantum {:?})", total_timeout, name, quantum);

        loop {
            let now = self.clock.now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => quantum.min(deadline - now),
                None => quantum,
            };

            match source.poll(name, remaining).map_err(WaitError::Source)? {
                Polled::TimedOut => {
                    let elapsed = self.clock.now() - start;
                    if self.log_progress {
                        info!("Still waiting for {} after {:?}", name, elapsed);
                    } else {
                        trace!("Still waiting for {} after {:?}", name, elapsed);
                    }
                    callbacks.on_waiting(elapsed);
                }
                Polled::Event(payload) => {
                    let elapsed = self.clock.now() - start;
                    let event = Event::new(payload, elapsed);
                    if callbacks.on_received(&event, elapsed) {
                        debug!("Matched {} after {:?}", name, elapsed);
                        return Ok(WaitOutcome::Matched { event, elapsed });
                    }
                    trace!("Ignored {} after {:?}", name, elapsed);
                }
            }
        }

        let elapsed = self.clock.now() - start;
        debug!("Gave up on {} after {:?}", name, elapsed);
        callbacks.on_missed();
        Ok(WaitOutcome::GivenUp { elapsed })
    }

    /// Wait for the first event called `name` that satisfies `predicate`
    pub fn wait_for<S>(
        &self,
        source: &S,
        name: &str,
        total_timeout: Duration,
        mut predicate: impl FnMut(&S::Payload) -> bool,
    ) -> Result<WaitOutcome<S::Payload>, WaitError<S::Error>>
    where
        S: EventSource + ?Sized,
    {
        self.wait(source, name, total_timeout, &mut Filter(&mut predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ScriptError;
    use crate::script::{ScriptedEvent, ScriptedEventSource};
    use serde_json::{json, Value};
    use std::cell::Cell;
    use std::sync::Arc;

    const SECOND: Duration = Duration::from_secs(1);

    fn scripted(clock: &Arc<ManualClock>, quantum: Duration, events: Vec<ScriptedEvent>) -> ScriptedEventSource {
        ScriptedEventSource::new(Arc::clone(clock), quantum).with_events(events)
    }

    /// Counts every callback and accepts after `reject` events
    #[derive(Default)]
    struct Recorder {
        reject: usize,
        received: usize,
        waiting: Vec<Duration>,
        missed: usize,
    }

    impl<P> WaitCallbacks<P> for Recorder {
        fn on_received(&mut self, _event: &Event<P>, _elapsed: Duration) -> bool {
            self.received += 1;
            self.received > self.reject
        }

        fn on_waiting(&mut self, elapsed: Duration) {
            self.waiting.push(elapsed);
        }

        fn on_missed(&mut self) {
            self.missed += 1;
        }
    }

    #[test]
    fn test_gives_up_when_nothing_arrives() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(&clock, 2 * SECOND, vec![]);
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder::default();

        let outcome = waiter.wait(&source, "onConnect", 5 * SECOND, &mut recorder).unwrap();

        assert_eq!(outcome, WaitOutcome::GivenUp { elapsed: 5 * SECOND });
        assert_eq!(recorder.waiting, vec![2 * SECOND, 4 * SECOND, 5 * SECOND]);
        assert_eq!(recorder.missed, 1);
        assert_eq!(recorder.received, 0);
        assert_eq!(source.poll_count(), 3);
    }

    #[test]
    fn test_given_up_within_one_quantum_of_budget() {
        for (total, quantum) in [(1, 1), (3, 2), (10, 3), (7, 10)] {
            let clock = Arc::new(ManualClock::new());
            let source = scripted(&clock, quantum * SECOND, vec![]);
            let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));

            let outcome = waiter
                .wait(&source, "onScanResult", total * SECOND, &mut AcceptFirst)
                .unwrap();

            assert!(!outcome.is_matched());
            assert!(outcome.elapsed() >= total * SECOND);
            assert!(outcome.elapsed() <= (total + quantum) * SECOND);
        }
    }

    #[test]
    fn test_rejected_event_then_match() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            2 * SECOND,
            vec![
                ScriptedEvent::new(SECOND, "onBond", json!({"state": "bonding"})),
                ScriptedEvent::new(3 * SECOND, "onBond", json!({"state": "bonded"})),
            ],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder {
            reject: 1,
            ..Default::default()
        };

        let outcome = waiter.wait(&source, "onBond", 10 * SECOND, &mut recorder).unwrap();

        let event = outcome.event().unwrap();
        assert_eq!(event.payload(), &json!({"state": "bonded"}));
        assert_eq!(event.elapsed(), 3 * SECOND);
        assert_eq!(outcome.elapsed(), 3 * SECOND);
        assert_eq!(recorder.received, 2);
        assert_eq!(recorder.missed, 0);
    }

    #[test]
    fn test_no_poll_after_match() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            SECOND,
            vec![
                ScriptedEvent::new(Duration::from_millis(500), "onReady", Value::Null),
                ScriptedEvent::new(Duration::from_millis(600), "onReady", Value::Null),
            ],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));

        let outcome = waiter.wait(&source, "onReady", 5 * SECOND, &mut AcceptFirst).unwrap();

        assert!(outcome.is_matched());
        assert_eq!(source.poll_count(), 1);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_waiting_count_tracks_quantum() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            SECOND,
            vec![ScriptedEvent::new(Duration::from_millis(4_500), "onConnect", Value::Null)],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder::default();

        let outcome = waiter.wait(&source, "onConnect", 10 * SECOND, &mut recorder).unwrap();

        assert_eq!(outcome.elapsed(), Duration::from_millis(4_500));
        assert_eq!(recorder.waiting.len(), 4);
    }

    #[test]
    fn test_waiter_quantum_caps_source_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(&clock, 10 * SECOND, vec![]);
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock)).with_poll_quantum(SECOND);
        let mut recorder = Recorder::default();

        assert_eq!(waiter.poll_quantum_for(&source), SECOND);
        waiter.wait(&source, "onConnect", 3 * SECOND, &mut recorder).unwrap();
        assert_eq!(recorder.waiting.len(), 3);
    }

    #[test]
    fn test_events_with_other_names_are_not_received() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            SECOND,
            vec![ScriptedEvent::new(SECOND, "onDisconnect", Value::Null)],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder::default();

        let outcome = waiter.wait(&source, "onConnect", 2 * SECOND, &mut recorder).unwrap();

        assert!(!outcome.is_matched());
        assert_eq!(recorder.received, 0);
    }

    #[test]
    fn test_invalid_arguments_fail_before_polling() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(&clock, SECOND, vec![]);
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));

        let err = waiter.wait(&source, "", SECOND, &mut AcceptFirst).unwrap_err();
        assert!(err.is_invalid_argument());

        let err = waiter
            .wait(&source, "onConnect", Duration::ZERO, &mut AcceptFirst)
            .unwrap_err();
        assert!(err.is_invalid_argument());

        let zero_quantum = BoundedEventWaiter::with_clock(Arc::clone(&clock)).with_poll_quantum(Duration::ZERO);
        let err = zero_quantum
            .wait(&source, "onConnect", SECOND, &mut AcceptFirst)
            .unwrap_err();
        assert!(err.is_invalid_argument());

        assert_eq!(source.poll_count(), 0);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_transport_failure_propagates() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(&clock, SECOND, vec![]).with_failure(Duration::from_millis(2_500), "stream reset");
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder::default();

        let err = waiter.wait(&source, "onConnect", 10 * SECOND, &mut recorder).unwrap_err();

        assert_eq!(err.into_source(), Some(ScriptError::Injected("stream reset".into())));
        assert_eq!(recorder.waiting.len(), 2);
        assert_eq!(recorder.missed, 0);
        assert_eq!(source.poll_count(), 3);
    }

    #[test]
    fn test_closure_callbacks() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            SECOND,
            vec![
                ScriptedEvent::new(SECOND, "onRssi", json!(-80)),
                ScriptedEvent::new(2 * SECOND, "onRssi", json!(-40)),
            ],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let waited = Cell::new(0);
        let missed = Cell::new(false);

        let mut callbacks = Callbacks::new()
            .on_received(|event: &Event<Value>, _| event.payload().as_i64() > Some(-50))
            .on_waiting(|_| waited.set(waited.get() + 1))
            .on_missed(|| missed.set(true));
        let outcome = waiter.wait(&source, "onRssi", 5 * SECOND, &mut callbacks).unwrap();

        assert_eq!(outcome.into_event().map(Event::into_payload), Some(json!(-40)));
        assert_eq!(waited.get(), 0);
        assert!(!missed.get());
    }

    #[test]
    fn test_wait_for_predicate() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            SECOND,
            vec![
                ScriptedEvent::new(SECOND, "onState", json!("TURNING_ON")),
                ScriptedEvent::new(2 * SECOND, "onState", json!("ON")),
            ],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));

        let outcome = waiter
            .wait_for(&source, "onState", 5 * SECOND, |state| state == "ON")
            .unwrap();
        assert_eq!(outcome.elapsed(), 2 * SECOND);
    }

    #[test]
    fn test_wall_clock_wait() {
        use crate::events::{DeviceEvent, EventBus};

        let bus = EventBus::new();
        let subscription = bus.subscribe().with_max_poll(Duration::from_millis(20));
        let waiter = BoundedEventWaiter::new();
        let mut recorder = Recorder::default();

        let outcome = waiter
            .wait(&subscription, "onConnect", Duration::from_millis(70), &mut recorder)
            .unwrap();
        assert!(!outcome.is_matched());
        assert!(outcome.elapsed() >= Duration::from_millis(70));
        assert!(!recorder.waiting.is_empty());
        assert_eq!(recorder.missed, 1);

        bus.emit(DeviceEvent::new("onConnect", json!({"handle": 1})));
        let outcome = waiter
            .wait(&subscription, "onConnect", Duration::from_millis(70), &mut AcceptFirst)
            .unwrap();
        assert!(outcome.is_matched());
    }

    #[test]
    fn test_unrepresentable_deadline_waits_without_bound() {
        use crate::events::{DeviceEvent, EventBus};

        let bus = EventBus::new();
        let subscription = bus.subscribe().with_max_poll(Duration::from_millis(20));
        bus.emit(DeviceEvent::new("onReady", json!(true)));

        let outcome = BoundedEventWaiter::new()
            .wait(&subscription, "onReady", Duration::MAX, &mut AcceptFirst)
            .unwrap();
        assert!(outcome.is_matched());
        assert_eq!(outcome.into_event().map(Event::into_payload), Some(json!(true)));
    }

    #[test]
    fn test_max_timeout_keeps_polling_until_match() {
        let clock = Arc::new(ManualClock::new());
        let source = scripted(
            &clock,
            2 * SECOND,
            vec![ScriptedEvent::new(7 * SECOND, "onBond", json!("bonded"))],
        );
        let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock));
        let mut recorder = Recorder::default();

        let outcome = waiter
            .wait(&source, "onBond", Duration::MAX, &mut recorder)
            .unwrap();
        assert_eq!(outcome.elapsed(), 7 * SECOND);
        assert_eq!(recorder.waiting, vec![2 * SECOND, 4 * SECOND, 6 * SECOND]);
        assert_eq!(recorder.missed, 0);
    }
}
