//! Closable event streams
//!
//! Forwards a device's streaming connection (for example a server-streaming
//! RPC of callback events) into an [`EventBus`], and makes sure the forwarding
//! task is stopped when the stream is closed or dropped.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use droid_waiter_core::{DeviceEvent, EventBus};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a forwarded stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Still forwarding
    Open,
    /// The remote side finished the stream
    Ended,
    /// The stream yielded an error and forwarding stopped
    Failed(String),
    /// Closed locally
    Closed,
}

/// A streaming connection pumped into an event bus
pub struct EventStream {
    name: String,
    token: CancellationToken,
    pump: Option<JoinHandle<()>>,
    state: Arc<RwLock<StreamState>>,
    forwarded: Arc<AtomicUsize>,
}

impl EventStream {
    /// Start forwarding `stream` into `bus`. Must be called inside a tokio runtime.
    pub fn spawn<S, E>(name: impl Into<String>, stream: S, bus: Arc<EventBus>) -> Self
    where
        S: Stream<Item = Result<DeviceEvent, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let state = Arc::new(RwLock::new(StreamState::Open));
        let forwarded = Arc::new(AtomicUsize::new(0));

        let pump = tokio::spawn(pump(
            name.clone(),
            stream,
            bus,
            token.clone(),
            Arc::clone(&state),
            Arc::clone(&forwarded),
        ));

        debug!("Opened event stream {}", name);
        Self {
            name,
            token,
            pump: Some(pump),
            state,
            forwarded,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.state.read().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Number of events delivered to the bus so far
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    /// Wait for the remote side to finish the stream.
    ///
    /// Returns the final state. Never returns for a stream that does not end
    /// on its own; use [`close`](Self::close) for those.
    pub async fn join(&mut self) -> StreamState {
        self.await_pump().await;
        self.state()
    }

    /// Stop forwarding and wait for the pump to exit.
    ///
    /// Returns the state the stream was in when it was closed. Closing an
    /// already closed stream is a no-op.
    pub async fn close(&mut self) -> StreamState {
        let previous = self.state();
        if previous == StreamState::Closed {
            return previous;
        }

        self.token.cancel();
        self.await_pump().await;

        *self.state.write() = StreamState::Closed;
        info!("Closed event stream {} after {} events", self.name, self.forwarded());
        previous
    }

    async fn await_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                // Teardown must not fail because the pump already died.
                if !e.is_cancelled() {
                    warn!("Event stream {} pump failed: {}", self.name, e);
                }
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("forwarded", &self.forwarded())
            .finish()
    }
}

async fn pump<S, E>(
    name: String,
    stream: S,
    bus: Arc<EventBus>,
    token: CancellationToken,
    state: Arc<RwLock<StreamState>>,
    forwarded: Arc<AtomicUsize>,
) where
    S: Stream<Item = Result<DeviceEvent, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut stream = Box::pin(stream);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Event stream {} cancelled", name);
                return;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    bus.emit(event);
                    forwarded.fetch_add(1, Ordering::SeqCst);
                }
                Some(Err(e)) => {
                    warn!("Event stream {} failed: {}", name, e);
                    *state.write() = StreamState::Failed(e.to_string());
                    return;
                }
                None => {
                    debug!("Event stream {} ended", name);
                    *state.write() = StreamState::Ended;
                    return;
                }
            }
        }
    }
}
