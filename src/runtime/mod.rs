//! Isolated-context runtime.
//!
//! [`RuntimeSupervisor`] owns the script engine and the isolated half of the
//! channel, and runs the per-frame produce-and-wait cycle:
//!
//! ```text
//!   read_input + read_timing ─► engine.run_frame ─► publish_instructions
//!        ▲                                                    │
//!        │                                             complete_frame
//!        │                                                    │
//!        └────────────── next frame ◄──────────────────── await_turn
//! ```
//!
//! State machine:
//!
//! ```text
//!   uninitialized ─initialize─► initializing ─ok──► idle ─start─► running ─stop─► stopped
//!                                    │                              │  ▲            │
//!                                    └─fail──► error ◄──frame fail──┘  └───start────┘
//!
//!   initialize is accepted from any state except initializing and running;
//!   a rejected initialize disposes the channel it carried.
//! ```
//!
//! Failures never escape as panics or `Err` to the host; they become
//! [`RuntimeEvent`]s on the [`EventSink`].

pub mod dispatcher;
#[cfg(feature = "rhai")]
pub mod rhai_engine;
pub mod script;

pub use dispatcher::{BoundaryDispatcher, ControlMessage, Envelope, IsolatedContext};
#[cfg(feature = "rhai")]
pub use rhai_engine::RhaiEngine;
pub use script::{EngineFactory, FrameInputs, NativeScript, ScriptEngine};

use std::sync::Arc;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelResource, FrameChannel};
use crate::error::{ChannelError, ProtocolError, ScriptError};
use crate::types::RuntimeState;

// =============================================================================
// EVENTS
// =============================================================================

/// Isolated context → host event protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    Ready,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    StateChanged {
        state: RuntimeState,
    },
}

impl From<ScriptError> for RuntimeEvent {
    fn from(err: ScriptError) -> Self {
        RuntimeEvent::Error {
            message: err.message,
            trace: err.trace,
        }
    }
}

impl From<&ProtocolError> for RuntimeEvent {
    fn from(err: &ProtocolError) -> Self {
        RuntimeEvent::Error {
            message: err.to_string(),
            trace: None,
        }
    }
}

/// Where the supervisor sends its events.
pub trait EventSink {
    fn emit(&mut self, event: RuntimeEvent);
}

impl EventSink for Vec<RuntimeEvent> {
    fn emit(&mut self, event: RuntimeEvent) {
        self.push(event);
    }
}

impl EventSink for Sender<RuntimeEvent> {
    fn emit(&mut self, event: RuntimeEvent) {
        if self.send(event).is_err() {
            tracing::debug!("runtime event dropped: host receiver gone");
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// What happened in one call to [`RuntimeSupervisor::run_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame ran and the host handed the turn back.
    Completed,
    /// Not running; nothing happened.
    Skipped,
    /// The cycle ended during this frame (script failure or channel disposed).
    Halted,
}

pub struct RuntimeSupervisor<S: EventSink> {
    state: RuntimeState,
    factory: EngineFactory,
    engine: Option<Box<dyn ScriptEngine>>,
    channel: Option<Arc<Channel>>,
    events: S,
    frames_run: u64,
}

impl<S: EventSink> RuntimeSupervisor<S> {
    pub fn new(factory: EngineFactory, events: S) -> Self {
        Self {
            state: RuntimeState::Uninitialized,
            factory,
            engine: None,
            channel: None,
            events,
            frames_run: 0,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RuntimeState::Running
    }

    /// Script frames run since the last initialize.
    pub fn frames_run(&self) -> u64 {
        self.frames_run
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_deref()
    }

    /// Shared handle to the bound channel, for disposing it from another thread.
    pub fn channel_handle(&self) -> Option<Arc<Channel>> {
        self.channel.clone()
    }

    pub fn events(&self) -> &S {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut S {
        &mut self.events
    }

    fn transition(&mut self, next: RuntimeState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = %self.state, to = %next, "runtime state changed");
        self.state = next;
        self.events.emit(RuntimeEvent::StateChanged { state: next });
    }

    fn reject(&mut self, command: &'static str) -> Result<(), ProtocolError> {
        let err = ProtocolError::InvalidTransition {
            command,
            state: self.state,
        };
        self.report(&err);
        Err(err)
    }

    /// Emit a protocol error without changing state.
    pub fn report(&mut self, err: &ProtocolError) {
        tracing::warn!(error = %err, state = %self.state, "protocol error");
        self.events.emit(err.into());
    }

    fn fail(&mut self, err: ScriptError) {
        tracing::error!(error = %err, frame = self.frames_run, "script failed");
        self.transition(RuntimeState::Error);
        self.events.emit(err.into());
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Bind a channel and load a script with a fresh engine.
    ///
    /// Ends in `idle` (ready event) or `error` (error event).
    pub fn initialize(&mut self, source: &str, resource: ChannelResource) -> Result<(), ProtocolError> {
        if matches!(self.state, RuntimeState::Initializing | RuntimeState::Running) {
            // Tell the host half too: its channel will never be driven.
            resource.bind().dispose();
            return self.reject("initialize");
        }
        self.transition(RuntimeState::Initializing);

        if let Some(previous) = self.channel.take() {
            previous.dispose();
        }
        let channel = resource.bind();
        tracing::debug!(transport = %channel.kind(), "isolated channel bound");
        self.channel = Some(Arc::new(channel));
        self.frames_run = 0;

        let mut engine = (self.factory)();
        match engine.load(source) {
            Ok(()) => {
                self.engine = Some(engine);
                self.transition(RuntimeState::Idle);
                self.events.emit(RuntimeEvent::Ready);
            }
            Err(err) => {
                self.engine = None;
                self.fail(err);
            }
        }
        Ok(())
    }

    /// Begin (or resume) the frame cycle. Accepted from `idle` and `stopped`.
    pub fn start(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            RuntimeState::Running => Ok(()),
            RuntimeState::Idle | RuntimeState::Stopped => {
                self.transition(RuntimeState::Running);
                Ok(())
            }
            _ => self.reject("start"),
        }
    }

    /// Halt the cycle. The frame already in flight has finished by the time a
    /// command can be processed, so this takes effect immediately.
    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            RuntimeState::Running => {
                self.transition(RuntimeState::Stopped);
                Ok(())
            }
            RuntimeState::Idle | RuntimeState::Stopped => Ok(()),
            _ => self.reject("stop"),
        }
    }

    // =========================================================================
    // FRAME CYCLE
    // =========================================================================

    /// Run one frame, blocking in `await_turn` until the host signals.
    pub fn run_frame(&mut self) -> FrameOutcome {
        if self.state != RuntimeState::Running {
            return FrameOutcome::Skipped;
        }
        let (Some(engine), Some(channel)) = (self.engine.as_mut(), self.channel.clone()) else {
            self.fail(ScriptError::new("running without a loaded script"));
            return FrameOutcome::Halted;
        };

        let inputs = FrameInputs {
            input: channel.read_input(),
            timing: channel.read_timing(),
        };
        let mut batch = Vec::new();
        if let Err(err) = engine.run_frame(&inputs, &mut batch) {
            self.frames_run += 1;
            self.fail(err);
            return FrameOutcome::Halted;
        }
        self.frames_run += 1;

        match channel.publish_instructions(batch) {
            Ok(()) => {}
            Err(ChannelError::Disposed) => return self.channel_closed(),
            Err(err @ ChannelError::Overflow { .. }) => {
                self.events.emit(RuntimeEvent::Error {
                    message: err.to_string(),
                    trace: None,
                });
            }
            Err(err) => {
                self.fail(ScriptError::new(err.to_string()));
                return FrameOutcome::Halted;
            }
        }
        if channel.complete_frame().is_err() {
            return self.channel_closed();
        }

        match channel.await_turn() {
            Ok(()) => FrameOutcome::Completed,
            Err(ChannelError::Disposed) => self.channel_closed(),
            Err(err) => {
                self.fail(ScriptError::new(err.to_string()));
                FrameOutcome::Halted
            }
        }
    }

    fn channel_closed(&mut self) -> FrameOutcome {
        tracing::info!(frame = self.frames_run, "channel disposed, halting frame cycle");
        self.transition(RuntimeState::Stopped);
        FrameOutcome::Halted
    }

    /// Release the channel and engine. Safe in any state.
    pub fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.dispose();
        }
        self.engine = None;
        if self.state == RuntimeState::Running {
            self.transition(RuntimeState::Stopped);
        }
    }
}

impl<S: EventSink> Drop for RuntimeSupervisor<S> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.dispose();
        }
    }
}

impl<S: EventSink> std::fmt::Debug for RuntimeSupervisor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSupervisor")
            .field("state", &self.state)
            .field("frames_run", &self.frames_run)
            .field("channel", &self.channel)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{HostCapabilities, create_channel_pair};
    use crate::config::{ChannelConfig, TransportMode};
    use crate::types::DrawInstruction;

    fn failing_load() -> EngineFactory {
        struct BrokenEngine;
        impl ScriptEngine for BrokenEngine {
            fn load(&mut self, _source: &str) -> Result<(), ScriptError> {
                Err(ScriptError::new("unexpected token").with_trace("line 1, position 4"))
            }
            fn run_frame(&mut self, _: &FrameInputs, _: &mut Vec<DrawInstruction>) -> Result<(), ScriptError> {
                Ok(())
            }
        }
        Box::new(|| Box::new(BrokenEngine))
    }

    fn clear_each_frame() -> EngineFactory {
        Box::new(|| {
            Box::new(NativeScript::new(|_: &FrameInputs, out: &mut Vec<DrawInstruction>| {
                out.push(DrawInstruction::Clear);
                Ok(())
            }))
        })
    }

    fn pair(mode: TransportMode) -> (Channel, ChannelResource) {
        let config = ChannelConfig {
            mode,
            ..ChannelConfig::default()
        };
        create_channel_pair(&config, &HostCapabilities::native()).unwrap().into_parts()
    }

    fn states(events: &[RuntimeEvent]) -> Vec<RuntimeState> {
        events
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_event_json_shapes() {
        let ready = serde_json::to_value(RuntimeEvent::Ready).unwrap();
        assert_eq!(ready, serde_json::json!({ "type": "ready" }));

        let changed = serde_json::to_value(RuntimeEvent::StateChanged {
            state: RuntimeState::Running,
        })
        .unwrap();
        assert_eq!(changed, serde_json::json!({ "type": "stateChanged", "state": "running" }));

        let error = serde_json::to_value(RuntimeEvent::Error {
            message: "boom".into(),
            trace: None,
        })
        .unwrap();
        assert_eq!(error, serde_json::json!({ "type": "error", "message": "boom" }));
    }

    #[test]
    fn test_initialize_ready() {
        let (_host, resource) = pair(TransportMode::SharedMemory);
        let mut supervisor = RuntimeSupervisor::new(clear_each_frame(), Vec::new());
        supervisor.initialize("", resource).unwrap();

        assert_eq!(supervisor.state(), RuntimeState::Idle);
        assert_eq!(
            supervisor.events(),
            &vec![
                RuntimeEvent::StateChanged { state: RuntimeState::Initializing },
                RuntimeEvent::StateChanged { state: RuntimeState::Idle },
                RuntimeEvent::Ready,
            ]
        );
    }

    #[test]
    fn test_load_failure_blocks_start() {
        let (_host, resource) = pair(TransportMode::MessagePassing);
        let mut supervisor = RuntimeSupervisor::new(failing_load(), Vec::new());
        supervisor.initialize("bad", resource).unwrap();
        assert_eq!(supervisor.state(), RuntimeState::Error);
        assert!(supervisor.events().contains(&RuntimeEvent::Error {
            message: "unexpected token".into(),
            trace: Some("line 1, position 4".into()),
        }));

        assert!(matches!(
            supervisor.start(),
            Err(ProtocolError::InvalidTransition { command: "start", state: RuntimeState::Error })
        ));
        assert_eq!(supervisor.state(), RuntimeState::Error);
        assert_eq!(supervisor.run_frame(), FrameOutcome::Skipped);
    }

    #[test]
    fn test_reinitialize_after_error() {
        let (_host, resource) = pair(TransportMode::MessagePassing);
        let mut supervisor = RuntimeSupervisor::new(failing_load(), Vec::new());
        supervisor.initialize("bad", resource).unwrap();
        supervisor.factory = clear_each_frame();

        let (_host, resource) = pair(TransportMode::MessagePassing);
        supervisor.initialize("good", resource).unwrap();
        assert_eq!(supervisor.state(), RuntimeState::Idle);
        supervisor.start().unwrap();
        assert!(supervisor.is_running());
    }

    #[test]
    fn test_frame_cycle_and_stop() {
        let (host, resource) = pair(TransportMode::SharedMemory);
        let mut supervisor = RuntimeSupervisor::new(clear_each_frame(), Vec::new());
        supervisor.initialize("", resource).unwrap();
        assert_eq!(supervisor.run_frame(), FrameOutcome::Skipped);

        supervisor.start().unwrap();
        host.signal_turn();
        assert_eq!(supervisor.run_frame(), FrameOutcome::Completed);
        assert_eq!(host.take_completed_frames(), 1);
        assert_eq!(host.drain_instructions().unwrap(), vec![DrawInstruction::Clear]);

        supervisor.stop().unwrap();
        assert_eq!(supervisor.run_frame(), FrameOutcome::Skipped);
        supervisor.start().unwrap();
        assert_eq!(
            states(supervisor.events()),
            vec![
                RuntimeState::Initializing,
                RuntimeState::Idle,
                RuntimeState::Running,
                RuntimeState::Stopped,
                RuntimeState::Running,
            ]
        );
    }

    #[test]
    fn test_disposed_channel_stops_cycle() {
        let (host, resource) = pair(TransportMode::SharedMemory);
        let mut supervisor = RuntimeSupervisor::new(clear_each_frame(), Vec::new());
        supervisor.initialize("", resource).unwrap();
        supervisor.start().unwrap();

        host.dispose();
        assert_eq!(supervisor.run_frame(), FrameOutcome::Halted);
        assert_eq!(supervisor.state(), RuntimeState::Stopped);
    }

    #[test]
    fn test_commands_rejected_while_initializing_or_running() {
        let (_host, resource) = pair(TransportMode::MessagePassing);
        let mut supervisor = RuntimeSupervisor::new(clear_each_frame(), Vec::new());
        assert!(supervisor.start().is_err());
        supervisor.initialize("", resource).unwrap();
        supervisor.start().unwrap();

        for mode in [TransportMode::MessagePassing, TransportMode::SharedMemory] {
            let (host2, resource2) = pair(mode);
            assert!(supervisor.initialize("", resource2).is_err());
            assert!(supervisor.is_running());
            // The rejected pair is closed so its host half is not left waiting.
            assert!(host2.is_disposed(), "{mode:?}");
        }
        assert!(!supervisor.channel().unwrap().is_disposed());

        supervisor.shutdown();
        assert_eq!(supervisor.state(), RuntimeState::Stopped);
    }
}
