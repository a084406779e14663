//! Boundary dispatcher and the isolated context thread.
//!
//! Control messages arrive as an [`Envelope`]: a JSON body plus an optional
//! transferred [`ChannelResource`], mirroring a structured-clone message with a
//! transfer list. The dispatcher parses them into [`ControlMessage`]s and drives
//! the supervisor; anything it cannot parse becomes an error event.
//!
//! ```text
//!   host                                   isolated thread
//!   ────                                   ───────────────
//!   post(Envelope) ── crossbeam ──► dispatch ─► RuntimeSupervisor ─► run_frame loop
//!   events()       ◄─ crossbeam ── RuntimeEvent
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{EngineFactory, EventSink, FrameOutcome, RuntimeEvent, RuntimeSupervisor};
use crate::channel::{Channel, ChannelResource, FrameChannel};
use crate::error::{ChannelError, ProtocolError};
use crate::types::RuntimeState;

// =============================================================================
// MESSAGES
// =============================================================================

/// A control message as it crosses the boundary.
#[derive(Debug)]
pub struct Envelope {
    pub data: Value,
    pub transfer: Option<ChannelResource>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self { data, transfer: None }
    }

    pub fn initialize(script_source: impl Into<String>, channel: ChannelResource) -> Self {
        Self {
            data: json!({ "type": "initialize", "scriptSource": script_source.into() }),
            transfer: Some(channel),
        }
    }

    pub fn start() -> Self {
        Self::new(json!({ "type": "start" }))
    }

    pub fn stop() -> Self {
        Self::new(json!({ "type": "stop" }))
    }
}

/// Parsed host → isolated command.
#[derive(Debug)]
pub enum ControlMessage {
    Initialize {
        script_source: String,
        channel: ChannelResource,
    },
    Start,
    Stop,
}

impl ControlMessage {
    pub fn parse(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { data, transfer } = envelope;
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed {
                kind: "<none>".into(),
                reason: "missing string field `type`".into(),
            })?;

        match kind {
            "initialize" => {
                let script_source = data
                    .get("scriptSource")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "missing string field `scriptSource`"))?
                    .to_owned();
                let channel = transfer.ok_or_else(|| malformed(kind, "no channel resource transferred"))?;
                Ok(ControlMessage::Initialize { script_source, channel })
            }
            "start" => Ok(ControlMessage::Start),
            "stop" => Ok(ControlMessage::Stop),
            other => Err(ProtocolError::UnknownMessage(other.to_owned())),
        }
    }
}

fn malformed(kind: &str, reason: &str) -> ProtocolError {
    ProtocolError::Malformed {
        kind: kind.to_owned(),
        reason: reason.to_owned(),
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Routes control messages into a [`RuntimeSupervisor`].
#[derive(Debug)]
pub struct BoundaryDispatcher<S: EventSink> {
    supervisor: RuntimeSupervisor<S>,
}

impl<S: EventSink> BoundaryDispatcher<S> {
    pub fn new(factory: EngineFactory, events: S) -> Self {
        Self {
            supervisor: RuntimeSupervisor::new(factory, events),
        }
    }

    /// Handle one envelope. Failures are reported as error events.
    pub fn dispatch(&mut self, envelope: Envelope) {
        let message = match ControlMessage::parse(envelope) {
            Ok(message) => message,
            Err(err) => {
                self.supervisor.report(&err);
                return;
            }
        };
        tracing::debug!(?message, "control message");

        // Rejected commands have already been reported by the supervisor.
        let _ = match message {
            ControlMessage::Initialize { script_source, channel } => {
                self.supervisor.initialize(&script_source, channel)
            }
            ControlMessage::Start => self.supervisor.start(),
            ControlMessage::Stop => self.supervisor.stop(),
        };
    }

    pub fn run_frame(&mut self) -> FrameOutcome {
        self.supervisor.run_frame()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn state(&self) -> RuntimeState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &RuntimeSupervisor<S> {
        &self.supervisor
    }

    pub fn shutdown(&mut self) {
        self.supervisor.shutdown();
    }
}

// =============================================================================
// ISOLATED CONTEXT
// =============================================================================

/// The isolated channel currently bound by the supervisor, reachable from the handle.
type BoundChannel = Arc<Mutex<Option<Arc<Channel>>>>;

/// Handle to a dispatcher + supervisor running on their own thread.
///
/// Dropping the handle closes the control link, disposes the bound channel (which
/// releases a supervisor parked in `await_turn`) and joins the thread.
pub struct IsolatedContext {
    control: Option<Sender<Envelope>>,
    events: Receiver<RuntimeEvent>,
    bound: BoundChannel,
    handle: Option<JoinHandle<()>>,
}

impl IsolatedContext {
    pub fn spawn(factory: EngineFactory) -> io::Result<Self> {
        let (control_tx, control_rx) = channel::unbounded::<Envelope>();
        let (event_tx, event_rx) = channel::unbounded::<RuntimeEvent>();
        let bound = BoundChannel::default();

        let handle = thread::Builder::new()
            .name("frameport-isolated".to_string())
            .spawn({
                let bound = bound.clone();
                move || {
                    let mut dispatcher = BoundaryDispatcher::new(factory, event_tx);
                    Self::dispatch_loop(&mut dispatcher, control_rx, &bound);
                    dispatcher.shutdown();
                    bound.lock().take();
                    tracing::debug!("isolated context exiting");
                }
            })?;

        Ok(Self {
            control: Some(control_tx),
            events: event_rx,
            bound,
            handle: Some(handle),
        })
    }

    fn dispatch_loop(
        dispatcher: &mut BoundaryDispatcher<Sender<RuntimeEvent>>,
        control: Receiver<Envelope>,
        bound: &BoundChannel,
    ) {
        loop {
            // Pending commands are handled between frames; while idle, block on them.
            let envelope = if dispatcher.is_running() {
                match control.try_recv() {
                    Ok(envelope) => Some(envelope),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match control.recv() {
                    Ok(envelope) => Some(envelope),
                    Err(_) => break,
                }
            };

            match envelope {
                Some(envelope) => {
                    dispatcher.dispatch(envelope);
                    *bound.lock() = dispatcher.supervisor().channel_handle();
                }
                None => {
                    dispatcher.run_frame();
                }
            }
        }
    }

    /// Send a control message to the isolated context.
    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        match &self.control {
            Some(control) => control.send(envelope).map_err(|_| ChannelError::Disposed),
            None => Err(ChannelError::Disposed),
        }
    }

    /// Events emitted by the isolated context, in order.
    pub fn events(&self) -> &Receiver<RuntimeEvent> {
        &self.events
    }

    /// Close the control link, dispose the bound channel and wait for the thread
    /// to finish.
    pub fn join(mut self) {
        self.close();
    }

    fn close(&mut self) {
        // Control first: a channel bound after this point is never awaited on.
        self.control.take();
        let bound = self.bound.lock().take();
        if let Some(channel) = bound {
            channel.dispose();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("isolated context thread panicked");
            }
        }
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IsolatedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedContext")
            .field("open", &self.control.is_some())
            .field("pending_events", &self.events.len())
            .finish()
    }
}
