//! Droid Waiter Harness
//!
//! Drives several devices through one test: two-phase parallel setup,
//! per-device bounded waits, and safe teardown of streaming connections.

pub mod device;
pub mod stream;
pub mod testbed;

pub use device::{DeviceController, DeviceError, SetupPhase};
pub use stream::{EventStream, StreamState};
pub use testbed::{wait_once, EventFilter, HarnessError, Testbed, TestbedState};
