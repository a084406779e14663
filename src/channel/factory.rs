//! Transport selection.
//!
//! The host calls [`create_channel_pair`] once per isolated context. It binds the
//! host half immediately and returns the isolated half as a [`ChannelResource`]
//! to be moved into the new context, where [`ChannelResource::bind`] finishes it.

use super::message::LinkEndpoint;
use super::segment::SharedSegment;
use super::shared_memory::SharedMemoryChannel;
use super::{Channel, TransportKind};
use crate::config::{ChannelConfig, TransportMode, WaitStrategy};
use crate::error::ChannelError;
use crate::types::Role;

/// What the host environment allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Memory can be shared between contexts.
    pub shared_memory: bool,
    /// The host is isolated enough to hand shared memory to another context.
    pub cross_context_isolated: bool,
}

impl HostCapabilities {
    /// Native threads: everything available.
    pub fn native() -> Self {
        Self {
            shared_memory: true,
            cross_context_isolated: true,
        }
    }

    /// A host that only supports message passing.
    pub fn restricted() -> Self {
        Self {
            shared_memory: false,
            cross_context_isolated: false,
        }
    }

    pub fn supports_shared_memory(&self) -> bool {
        self.shared_memory && self.cross_context_isolated
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::native()
    }
}

/// The isolated half of a pair, ready to be moved into the isolated context.
#[derive(Debug)]
pub enum ChannelResource {
    SharedMemory {
        segment: SharedSegment,
        wait: WaitStrategy,
    },
    MessagePassing(LinkEndpoint),
}

impl ChannelResource {
    pub fn kind(&self) -> TransportKind {
        match self {
            ChannelResource::SharedMemory { .. } => TransportKind::SharedMemory,
            ChannelResource::MessagePassing(_) => TransportKind::MessagePassing,
        }
    }

    /// Bind the isolated role.
    pub fn bind(self) -> Channel {
        match self {
            ChannelResource::SharedMemory { segment, wait } => {
                SharedMemoryChannel::bind(segment, Role::Isolated, wait).into()
            }
            ChannelResource::MessagePassing(endpoint) => endpoint.bind(Role::Isolated).into(),
        }
    }
}

/// Result of [`create_channel_pair`].
#[derive(Debug)]
pub struct ChannelPair {
    pub kind: TransportKind,
    pub host: Channel,
    pub isolated: ChannelResource,
}

impl ChannelPair {
    pub fn into_parts(self) -> (Channel, ChannelResource) {
        (self.host, self.isolated)
    }
}

/// Build a channel pair for the configured mode.
///
/// `Auto` prefers shared memory and falls back to message passing. An explicit
/// `SharedMemory` request on a host without the capability fails with
/// [`ChannelError::Unavailable`].
pub fn create_channel_pair(
    config: &ChannelConfig,
    capabilities: &HostCapabilities,
) -> Result<ChannelPair, ChannelError> {
    let kind = match config.mode {
        TransportMode::SharedMemory if !capabilities.shared_memory => {
            return Err(ChannelError::Unavailable {
                reason: "host does not support shared memory",
            });
        }
        TransportMode::SharedMemory if !capabilities.cross_context_isolated => {
            return Err(ChannelError::Unavailable {
                reason: "host is not cross-context isolated",
            });
        }
        TransportMode::SharedMemory => TransportKind::SharedMemory,
        TransportMode::MessagePassing => TransportKind::MessagePassing,
        TransportMode::Auto if capabilities.supports_shared_memory() => TransportKind::SharedMemory,
        TransportMode::Auto => {
            tracing::info!("shared memory unavailable, falling back to message passing");
            TransportKind::MessagePassing
        }
    };

    let pair = match kind {
        TransportKind::SharedMemory => {
            let segment = SharedSegment::new(config.segment_size)?;
            let host = SharedMemoryChannel::bind(segment.clone(), Role::Host, config.wait);
            ChannelPair {
                kind,
                host: host.into(),
                isolated: ChannelResource::SharedMemory {
                    segment,
                    wait: config.wait,
                },
            }
        }
        TransportKind::MessagePassing => {
            let (host_end, isolated_end) = LinkEndpoint::pair();
            ChannelPair {
                kind,
                host: host_end.bind(Role::Host).into(),
                isolated: ChannelResource::MessagePassing(isolated_end),
            }
        }
    };

    tracing::debug!(transport = %kind, mode = ?config.mode, "channel pair created");
    Ok(pair)
}
