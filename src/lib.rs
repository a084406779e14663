//! # frameport
//!
//! Frame-synchronized channel between a host rendering context and an isolated
//! script context.
//!
//! A sandboxed script runs on its own thread, producing drawing instructions once
//! per frame. The host drains them, publishes input and timing, and hands the turn
//! back. At most one frame of work is ever in flight between the two.
//!
//! ## Architecture
//!
//! ```text
//!   HOST                                            ISOLATED CONTEXT
//!   ────                                            ────────────────
//!   RefreshDriver ─► FramePacer ─► run_host_frame   IsolatedContext thread
//!                                      │            BoundaryDispatcher ─► RuntimeSupervisor
//!                                      │                                      │
//!                                      └──── Channel (shared memory | messages) ◄──┘
//! ```
//!
//! [`create_channel_pair`] picks the transport: a shared memory segment of atomic
//! words with futex wake-up when the host allows it, an ordered message link otherwise.
//!
//! ## Modules
//!
//! - [`types`] - Draw instructions, input and timing snapshots, roles, states
//! - [`channel`] - Channel contract, both transports, the factory
//! - [`pacer`] - Frame pacer and refresh driver
//! - [`host`] - Host-side per-frame state and cycle
//! - [`runtime`] - Supervisor state machine, dispatcher, script engines
//! - [`config`] - TOML configuration
//! - [`logging`] - `tracing` subscriber setup

pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod pacer;
pub mod runtime;
pub mod types;

pub use types::*;

pub use channel::{
    Channel, ChannelPair, ChannelResource, FrameChannel, HostCapabilities, TransportKind,
    create_channel_pair,
};

pub use config::{BridgeConfig, ChannelConfig, PacerConfig, ScriptLimits, TransportMode, WaitStrategy};

pub use error::{ChannelError, ConfigError, DecodeError, ProtocolError, ScriptError};

pub use host::{HostFrameState, InputState, InstructionSink, host_frame_callback, run_host_frame};

pub use pacer::{FramePacer, RefreshDriver};

pub use runtime::{
    BoundaryDispatcher, ControlMessage, EngineFactory, Envelope, EventSink, FrameInputs,
    FrameOutcome, IsolatedContext, NativeScript, RuntimeEvent, RuntimeSupervisor, ScriptEngine,
};

#[cfg(feature = "rhai")]
pub use runtime::RhaiEngine;
#[cfg(feature = "rhai")]
pub use runtime::script::rhai_factory;
