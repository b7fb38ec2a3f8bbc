//! Testbed
//!
//! Coordinates a set of devices for one test:
//! - two-phase parallel setup
//! - bounded waits on each device's events, one worker per device
//! - teardown of streams and devices

use std::sync::Arc;
use std::time::Duration;

use droid_waiter_core::{
    AcceptFirst, BoundedEventWaiter, Callbacks, Event, SourceError, WaitError, WaitOutcome,
    WaiterConfig,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::device::{DeviceController, SetupPhase};
use crate::stream::EventStream;

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{phase} failed on {serial}: {reason}")]
    Setup {
        serial: String,
        phase: SetupPhase,
        reason: String,
    },
    #[error("Teardown failed on {serial}: {reason}")]
    Teardown { serial: String, reason: String },
    #[error("Wait on {serial} failed: {source}")]
    Wait {
        serial: String,
        #[source]
        source: WaitError<SourceError>,
    },
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Testbed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestbedState {
    /// Devices registered, nothing set up
    Idle,
    /// Running setup phases
    SettingUp,
    /// Every device is set up
    Ready,
    /// Closing streams and devices
    TearingDown,
    /// A setup phase failed
    Failed,
}

/// Accept predicate shared by every device's waiter
pub type EventFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A set of devices driven together
pub struct Testbed {
    config: WaiterConfig,
    state: RwLock<TestbedState>,
    devices: Vec<Arc<dyn DeviceController>>,
    streams: Mutex<Vec<EventStream>>,
}

impl Testbed {
    pub fn new(config: WaiterConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TestbedState::Idle),
            devices: Vec::new(),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Register a device. Serials must be unique.
    pub fn add_device(&mut self, device: Arc<dyn DeviceController>) -> Result<(), HarnessError> {
        if self.state() != TestbedState::Idle {
            return Err(HarnessError::InvalidState(format!(
                "cannot add {} while {:?}",
                device.serial(),
                self.state()
            )));
        }
        if self.device(device.serial()).is_some() {
            return Err(HarnessError::InvalidState(format!(
                "device {} registered twice",
                device.serial()
            )));
        }
        debug!("Registered device {}", device.serial());
        self.devices.push(device);
        Ok(())
    }

    pub fn state(&self) -> TestbedState {
        *self.state.read()
    }

    fn set_state(&self, state: TestbedState) {
        let mut current = self.state.write();
        debug!("Testbed state: {:?} -> {:?}", *current, state);
        *current = state;
    }

    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    pub fn device(&self, serial: &str) -> Option<&Arc<dyn DeviceController>> {
        self.devices.iter().find(|d| d.serial() == serial)
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.serial().to_string()).collect()
    }

    /// Keep a stream open until teardown
    pub fn attach_stream(&self, stream: EventStream) {
        debug!("Attached stream {}", stream.name());
        self.streams.lock().push(stream);
    }

    /// Set up every device in two phases.
    ///
    /// All devices prepare in parallel; only when every one of them has
    /// succeeded do they activate, again in parallel.
    pub async fn setup(&self) -> Result<(), HarnessError> {
        match self.state() {
            TestbedState::Idle | TestbedState::Failed => {}
            other => {
                return Err(HarnessError::InvalidState(format!("cannot set up while {:?}", other)));
            }
        }

        info!("Setting up {} devices", self.devices.len());
        self.set_state(TestbedState::SettingUp);

        for phase in [SetupPhase::Prepare, SetupPhase::Activate] {
            if let Err(e) = self.run_phase(phase).await {
                warn!("Setup aborted: {}", e);
                self.set_state(TestbedState::Failed);
                return Err(e);
            }
        }

        self.set_state(TestbedState::Ready);
        info!("Testbed ready");
        Ok(())
    }

    async fn run_phase(&self, phase: SetupPhase) -> Result<(), HarnessError> {
        debug!("Running {} on {} devices", phase, self.devices.len());
        let semaphore = Arc::new(Semaphore::new(self.config.harness.max_parallel_setup.max(1)));
        let limit = self.config.harness.setup_timeout();

        let tasks = self.devices.iter().map(|device| {
            let device = Arc::clone(device);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let serial = device.serial().to_string();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(HarnessError::InvalidState("setup semaphore closed".into())),
                };

                // A timed out worker keeps running on its blocking thread; the
                // testbed only stops waiting for it.
                let worker = tokio::task::spawn_blocking(move || device.run_phase(phase));
                match tokio::time::timeout(limit, worker).await {
                    Err(_) => Err(HarnessError::Setup {
                        serial,
                        phase,
                        reason: format!("timed out after {:?}", limit),
                    }),
                    Ok(Err(join)) => Err(HarnessError::Join(join)),
                    Ok(Ok(Err(e))) => Err(HarnessError::Setup {
                        serial,
                        phase,
                        reason: e.to_string(),
                    }),
                    Ok(Ok(Ok(()))) => {
                        debug!("{} finished {}", serial, phase);
                        Ok(())
                    }
                }
            }
        });

        join_all(tasks).await.into_iter().collect()
    }

    /// Wait on every device for the first event called `name`
    pub async fn wait_all(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<(String, WaitOutcome<Value>)>, HarnessError> {
        self.wait_all_matching(name, timeout, Arc::new(|_: &Value| true)).await
    }

    /// Wait on every device for the first event called `name` accepted by
    /// `filter`.
    ///
    /// Each device gets its own waiter on its own blocking worker, polling
    /// only that device's events. Results are in registration order.
    pub async fn wait_all_matching(
        &self,
        name: &str,
        timeout: Duration,
        filter: EventFilter,
    ) -> Result<Vec<(String, WaitOutcome<Value>)>, HarnessError> {
        self.ensure_ready()?;

        let tasks = self.devices.iter().map(|device| {
            let worker = self.spawn_wait(Arc::clone(device), name, timeout, Arc::clone(&filter));
            let serial = device.serial().to_string();
            async move { (serial, worker.await) }
        });

        let mut outcomes = Vec::with_capacity(self.devices.len());
        for (serial, joined) in join_all(tasks).await {
            let outcome = joined??;
            debug!("{}: {} matched={}", serial, name, outcome.is_matched());
            outcomes.push((serial, outcome));
        }
        Ok(outcomes)
    }

    /// Wait on a single device for the first event called `name`
    pub async fn wait_on(
        &self,
        serial: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome<Value>, HarnessError> {
        self.ensure_ready()?;
        let device = self
            .device(serial)
            .ok_or_else(|| HarnessError::UnknownDevice(serial.to_string()))?;

        self.spawn_wait(Arc::clone(device), name, timeout, Arc::new(|_: &Value| true))
            .await?
    }

    fn spawn_wait(
        &self,
        device: Arc<dyn DeviceController>,
        name: &str,
        timeout: Duration,
        filter: EventFilter,
    ) -> tokio::task::JoinHandle<Result<WaitOutcome<Value>, HarnessError>> {
        let waiter = BoundedEventWaiter::from_config(&self.config.wait);
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let serial = device.serial().to_string();
            let mut callbacks = Callbacks::new()
                .on_received(|event: &Event<Value>, _| filter(event.payload()))
                .on_missed(|| warn!("{} never raised {} within {:?}", serial, name, timeout));

            waiter
                .wait(device.events(), &name, timeout, &mut callbacks)
                .map_err(|source| HarnessError::Wait {
                    serial: device.serial().to_string(),
                    source,
                })
        })
    }

    fn ensure_ready(&self) -> Result<(), HarnessError> {
        match self.state() {
            TestbedState::Ready => Ok(()),
            other => Err(HarnessError::InvalidState(format!("cannot wait while {:?}", other))),
        }
    }

    /// Close every stream, then tear down every device in parallel.
    ///
    /// Every device is handled even if some fail; the first failure is
    /// returned.
    pub async fn teardown(&self) -> Result<(), HarnessError> {
        info!("Tearing down testbed");
        self.set_state(TestbedState::TearingDown);
        let limit = self.config.harness.teardown_timeout();

        let streams = std::mem::take(&mut *self.streams.lock());
        for mut stream in streams {
            if tokio::time::timeout(limit, stream.close()).await.is_err() {
                warn!("Timed out closing stream {}", stream.name());
            }
        }

        let tasks = self.devices.iter().map(|device| {
            let device = Arc::clone(device);
            async move {
                let serial = device.serial().to_string();
                let worker = tokio::task::spawn_blocking(move || device.teardown());
                (serial, tokio::time::timeout(limit, worker).await)
            }
        });

        let mut first_error = None;
        for (serial, result) in join_all(tasks).await {
            let error = match result {
                Err(_) => HarnessError::Timeout(format!("teardown of {} after {:?}", serial, limit)),
                Ok(Err(join)) => HarnessError::Join(join),
                Ok(Ok(Err(e))) => HarnessError::Teardown {
                    serial,
                    reason: e.to_string(),
                },
                Ok(Ok(Ok(()))) => continue,
            };
            warn!("{}", error);
            first_error.get_or_insert(error);
        }

        self.set_state(TestbedState::Idle);
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for Testbed {
    fn default() -> Self {
        Self::new(WaiterConfig::default())
    }
}

/// Wait on one device's events without a testbed
pub fn wait_once(
    device: &dyn DeviceController,
    name: &str,
    timeout: Duration,
) -> Result<WaitOutcome<Value>, WaitError<SourceError>> {
    BoundedEventWaiter::new().wait(device.events(), name, timeout, &mut AcceptFirst)
}
