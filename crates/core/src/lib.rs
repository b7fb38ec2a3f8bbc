//! Droid Waiter Core - Bounded event waiting
//!
//! This crate provides the waiting primitive used by the test harness:
//! a waiter that chains bounded polls against an event source, plus the
//! event sources, clocks, and configuration it works with.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod script;
pub mod source;
pub mod waiter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HarnessConfig, WaitConfig, WaiterConfig};
pub use error::{Result, ScriptError, SourceError, WaitError, WaiterError};
pub use events::{DeviceEvent, EventBus, EventSubscription};
pub use script::{Scenario, ScriptedEvent, ScriptedEventSource};
pub use source::{EventSource, Polled};
pub use waiter::{AcceptFirst, BoundedEventWaiter, Callbacks, Event, WaitCallbacks, WaitOutcome};

/// Droid Waiter version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
