//! droid-waiter
//!
//! Bounded event waiting for Android device tests.
//!
//! ## Architecture
//!
//! - `droid-waiter-core`: the bounded event waiter, event sources, clocks and configuration
//! - `droid-waiter-harness`: multi-device setup, per-device waits and closable event streams

#![warn(clippy::all)]

pub mod commands;

// Re-export main components for library usage
pub use droid_waiter_core as core;
pub use droid_waiter_harness as harness;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "droid-waiter";

/// Prelude module for convenient imports
pub mod prelude {
    pub use droid_waiter_core::{
        AcceptFirst, BoundedEventWaiter, Callbacks, DeviceEvent, EventBus, EventSource,
        EventSubscription, Polled, WaitCallbacks, WaitOutcome, WaiterConfig,
    };
    pub use droid_waiter_harness::{DeviceController, EventStream, Testbed};
}
