//! Device controllers
//!
//! A device under test as the harness sees it: something that can be set up
//! in two phases, exposes its callback events, and can be torn down.

use std::fmt;

use droid_waiter_core::EventSubscription;

/// Device errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Setup failed: {0}")]
    Setup(String),
    #[error("Teardown failed: {0}")]
    Teardown(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Setup phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    /// Per-device preparation that needs no peer (install, load snippets)
    Prepare,
    /// Work that assumes every device finished preparing (enable radios)
    Activate,
}

impl SetupPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SetupPhase::Prepare => "prepare",
            SetupPhase::Activate => "activate",
        }
    }
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A controllable device.
///
/// Calls are blocking; the testbed runs each on its own blocking worker.
pub trait DeviceController: Send + Sync + 'static {
    /// Stable identifier, usually the adb serial
    fn serial(&self) -> &str;

    /// Phase one of setup
    fn prepare(&self) -> Result<(), DeviceError>;

    /// Phase two of setup, run once every device is prepared
    fn activate(&self) -> Result<(), DeviceError>;

    /// Callback events raised by this device. Only one waiter polls it at a time.
    fn events(&self) -> &EventSubscription;

    fn teardown(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Run one setup phase
    fn run_phase(&self, phase: SetupPhase) -> Result<(), DeviceError> {
        match phase {
            SetupPhase::Prepare => self.prepare(),
            SetupPhase::Activate => self.activate(),
        }
    }
}
