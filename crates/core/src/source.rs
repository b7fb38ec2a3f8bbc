//! Event sources
//!
//! An event source is anything that can be asked for the next event with a
//! given name and will give up after a bounded amount of time. RPC event
//! streams, snippet callback queues and scripted timelines all fit.

use std::time::Duration;

/// Result of one bounded poll
#[derive(Debug, Clone, PartialEq)]
pub enum Polled<P> {
    /// An event with the requested name arrived
    Event(P),
    /// Nothing arrived within the poll timeout
    TimedOut,
}

impl<P> Polled<P> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Polled::TimedOut)
    }

    pub fn into_event(self) -> Option<P> {
        match self {
            Polled::Event(payload) => Some(payload),
            Polled::TimedOut => None,
        }
    }
}

/// A channel of named events with bounded-wait retrieval.
///
/// `poll` takes `&self`; sources that keep state use interior mutability.
/// A source must only be polled by one waiter at a time.
pub trait EventSource {
    /// Event payload handed to the caller
    type Payload;
    /// Transport failure. Timeouts are not errors and must be reported as
    /// [`Polled::TimedOut`].
    type Error: std::error::Error;

    /// Longest time a single `poll` is allowed to block
    fn max_poll_duration(&self) -> Duration;

    /// Wait up to `timeout` for the next event called `name`.
    ///
    /// Must not block longer than `timeout`.
    fn poll(&self, name: &str, timeout: Duration) -> Result<Polled<Self::Payload>, Self::Error>;
}

impl<S: EventSource + ?Sized> EventSource for &S {
    type Payload = S::Payload;
    type Error = S::Error;

    fn max_poll_duration(&self) -> Duration {
        (**self).max_poll_duration()
    }

    fn poll(&self, name: &str, timeout: Duration) -> Result<Polled<Self::Payload>, Self::Error> {
        (**self).poll(name, timeout)
    }
}
