//! Peer channel types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::devices::{RegistryDelta, SyncDigest};
use crate::wake::{WakeRequest, WakeResult};

/// Wire protocol version exchanged in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Identity of a participating process (phone, watch, widget host)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session state of the link to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Reachable,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Reachable => write!(f, "reachable"),
        }
    }
}

/// Handshake sent by both ends when a link opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    /// Whether this peer can send magic packets itself
    #[serde(default)]
    pub wake_capable: bool,
    #[serde(default = "default_protocol")]
    pub protocol: u32,
}

const fn default_protocol() -> u32 {
    PROTOCOL_VERSION
}

impl Hello {
    #[must_use]
    pub const fn new(peer_id: PeerId, wake_capable: bool) -> Self {
        Self {
            peer_id,
            wake_capable,
            protocol: PROTOCOL_VERSION,
        }
    }
}

/// Frame exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Hello(Hello),
    /// Local change pushed to peers
    Delta(RegistryDelta),
    /// Ask for every change newer than the digest
    ResyncRequest(SyncDigest),
    /// Answer to a resync request
    ResyncReply(RegistryDelta),
    WakeRequest(WakeRequest),
    WakeResult(WakeResult),
}

impl PeerMessage {
    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Delta(_) => "delta",
            Self::ResyncRequest(_) => "resync_request",
            Self::ResyncReply(_) => "resync_reply",
            Self::WakeRequest(_) => "wake_request",
            Self::WakeResult(_) => "wake_result",
        }
    }
}

/// Something that happened on the channel, delivered in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A frame arrived from a peer
    Message { from: PeerId, message: PeerMessage },
    /// A link changed state
    StateChanged {
        peer: PeerId,
        previous: LinkState,
        current: LinkState,
    },
}
