//! Channel contract and its two transports.
//!
//! ```text
//!   HOST CONTEXT                                   ISOLATED CONTEXT
//!   ────────────                                   ────────────────
//!   drain_instructions() ◄──── instruction batch ──── publish_instructions()
//!   take_completed_frames() ◄─ frames completed ───── complete_frame()
//!   publish_input()      ────► input slot ─────────► read_input()
//!   publish_timing()     ────► timing slot ────────► read_timing()
//!   signal_turn()        ────► turn token (cap 1) ─► await_turn()
//! ```
//!
//! Two interchangeable transports implement [`FrameChannel`]:
//!
//! - [`SharedMemoryChannel`]: one fixed-size segment of atomic words, futex wake.
//! - [`MessageChannel`]: an ordered bidirectional message link, payloads moved.
//!
//! [`create_channel_pair`] is the only place that decides between them.
//!
//! Ordering: anything published before `signal_turn` is visible to the
//! counterpart by the time its `await_turn` returns. Likewise, instructions
//! published before `complete_frame` are drainable once `take_completed_frames`
//! has counted that frame.

pub mod codec;
pub mod factory;
pub mod message;
pub mod segment;
pub mod shared_memory;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ChannelError, ProtocolError};
use crate::types::{DrawInstruction, InputSnapshot, Role, TimingSnapshot};

pub use factory::{ChannelPair, ChannelResource, HostCapabilities, create_channel_pair};
pub use message::{LinkEndpoint, MessageChannel};
pub use segment::SharedSegment;
pub use shared_memory::SharedMemoryChannel;

// =============================================================================
// Contract
// =============================================================================

/// Which transport backs a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    SharedMemory,
    MessagePassing,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::SharedMemory => f.write_str("shared-memory"),
            TransportKind::MessagePassing => f.write_str("message-passing"),
        }
    }
}

/// Operations every transport offers, identically on both roles.
///
/// Instructions conventionally flow isolated → host; input, timing and the turn
/// signal flow host → isolated.
pub trait FrameChannel: Send + Sync {
    fn role(&self) -> Role;

    fn kind(&self) -> TransportKind;

    /// Append a batch to the pending outgoing instructions. Never blocks.
    ///
    /// Empty batches are a no-op.
    fn publish_instructions(&self, batch: Vec<DrawInstruction>) -> Result<(), ChannelError>;

    /// Take every instruction published since the last drain, in publish order.
    ///
    /// Returns all of them or none. Never blocks.
    fn drain_instructions(&self) -> Result<Vec<DrawInstruction>, ChannelError>;

    /// Mark the producer's current frame as finished, even if it published nothing.
    fn complete_frame(&self) -> Result<(), ChannelError>;

    /// Frames the counterpart has completed since the last call. Resets the count.
    ///
    /// Returns 0 once this side is disposed.
    fn take_completed_frames(&self) -> u64;

    /// Replace the input slot (last write wins).
    fn publish_input(&self, snapshot: &InputSnapshot) -> Result<(), ChannelError>;

    /// Most recently published input, or the zero snapshot.
    fn read_input(&self) -> InputSnapshot;

    /// Replace the timing slot (last write wins).
    fn publish_timing(&self, snapshot: &TimingSnapshot) -> Result<(), ChannelError>;

    /// Most recently published timing, or the zero snapshot.
    fn read_timing(&self) -> TimingSnapshot;

    /// Block until the counterpart signals the turn, then consume the signal.
    ///
    /// Only one caller may wait on a channel at a time; a second concurrent
    /// caller gets [`ProtocolError::TurnAlreadyAwaited`]. Fails with
    /// [`ChannelError::Disposed`] if either side disposes while waiting.
    fn await_turn(&self) -> Result<(), ChannelError>;

    /// Hand the turn to the counterpart, waking at most one waiter.
    ///
    /// The token has capacity 1: signaling twice before a wait is the same as once.
    fn signal_turn(&self);

    /// Release the transport. Idempotent, callable from either side.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

// =============================================================================
// Channel
// =============================================================================

/// A role-bound channel of either transport, as built by the factory.
#[derive(Debug)]
pub enum Channel {
    SharedMemory(SharedMemoryChannel),
    MessagePassing(MessageChannel),
}

impl Channel {
    fn inner(&self) -> &dyn FrameChannel {
        match self {
            Channel::SharedMemory(c) => c,
            Channel::MessagePassing(c) => c,
        }
    }
}

impl FrameChannel for Channel {
    fn role(&self) -> Role {
        self.inner().role()
    }

    fn kind(&self) -> TransportKind {
        self.inner().kind()
    }

    fn publish_instructions(&self, batch: Vec<DrawInstruction>) -> Result<(), ChannelError> {
        self.inner().publish_instructions(batch)
    }

    fn drain_instructions(&self) -> Result<Vec<DrawInstruction>, ChannelError> {
        self.inner().drain_instructions()
    }

    fn complete_frame(&self) -> Result<(), ChannelError> {
        self.inner().complete_frame()
    }

    fn take_completed_frames(&self) -> u64 {
        self.inner().take_completed_frames()
    }

    fn publish_input(&self, snapshot: &InputSnapshot) -> Result<(), ChannelError> {
        self.inner().publish_input(snapshot)
    }

    fn read_input(&self) -> InputSnapshot {
        self.inner().read_input()
    }

    fn publish_timing(&self, snapshot: &TimingSnapshot) -> Result<(), ChannelError> {
        self.inner().publish_timing(snapshot)
    }

    fn read_timing(&self) -> TimingSnapshot {
        self.inner().read_timing()
    }

    fn await_turn(&self) -> Result<(), ChannelError> {
        self.inner().await_turn()
    }

    fn signal_turn(&self) {
        self.inner().signal_turn()
    }

    fn dispose(&self) {
        self.inner().dispose()
    }

    fn is_disposed(&self) -> bool {
        self.inner().is_disposed()
    }
}

impl From<SharedMemoryChannel> for Channel {
    fn from(channel: SharedMemoryChannel) -> Self {
        Channel::SharedMemory(channel)
    }
}

impl From<MessageChannel> for Channel {
    fn from(channel: MessageChannel) -> Self {
        Channel::MessagePassing(channel)
    }
}

// =============================================================================
// Turn guard
// =============================================================================

/// Enforces a single outstanding `await_turn` per channel instance.
#[derive(Debug, Default)]
pub(crate) struct TurnGuard {
    awaiting: AtomicBool,
}

impl TurnGuard {
    pub(crate) fn enter(&self) -> Result<TurnWaiter<'_>, ChannelError> {
        if self.awaiting.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::TurnAlreadyAwaited.into());
        }
        Ok(TurnWaiter { guard: self })
    }
}

pub(crate) struct TurnWaiter<'a> {
    guard: &'a TurnGuard,
}

impl Drop for TurnWaiter<'_> {
    fn drop(&mut self) {
        self.guard.awaiting.store(false, Ordering::Release);
    }
}
