//! Error types.
//!
//! Transport errors ([`ChannelError`]) are returned synchronously to the caller.
//! Script and lifecycle failures travel to the host asynchronously as
//! `RuntimeEvent::Error`, carrying a [`ScriptError`] or a [`ProtocolError`] message.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::types::RuntimeState;

/// Errors raised by a channel transport or the channel factory.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// The requested transport is not available in this host environment.
    #[error("transport unavailable: {reason}")]
    Unavailable { reason: &'static str },

    /// The instruction batch does not fit the segment's spare capacity. Nothing was written.
    #[error("instruction batch of {needed} bytes exceeds the {available} bytes left in the segment")]
    Overflow { needed: usize, available: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel has been disposed")]
    Disposed,

    #[error("corrupt instruction batch: {0}")]
    Decode(#[from] DecodeError),

    #[error("segment of {size} bytes is invalid; need a multiple of 4 of at least {min} bytes")]
    SegmentTooSmall { size: usize, min: usize },
}

/// Violations of the channel or control protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("a turn is already being awaited on this channel")]
    TurnAlreadyAwaited,

    #[error("unknown message type `{0}`")]
    UnknownMessage(String),

    #[error("malformed `{kind}` message: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("cannot {command} while {state}")]
    InvalidTransition {
        command: &'static str,
        state: RuntimeState,
    },
}

/// Instruction batch decode failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of batch")]
    UnexpectedEof,
    #[error("unknown instruction tag {0:#06x}")]
    UnknownTag(u16),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// A failure inside the sandboxed script, at load time or during a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    /// Diagnostic location or backtrace, when the engine can provide one.
    pub trace: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trace {
            Some(trace) => write!(f, "{} ({})", self.message, trace),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
