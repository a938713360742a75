//! Voice transport seam
//!
//! The transport (gateway, voice websocket, codec) is an external
//! collaborator. The bridge only needs the small surface below, and hands
//! the transport a [`FrameProducer`] it pulls one 20 ms frame from per tick.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::Frame;
use crate::error::TransportError;

/// Remote voice channel identifier
pub type ChannelId = u64;

/// Remote group (server/guild) identifier
pub type GroupId = u64;

/// Live transport binding to one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Resolved channel metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    /// Display name
    pub name: String,
    /// Group the channel belongs to; at most one session per group
    pub group: GroupId,
    /// Display name of the group
    pub group_name: String,
}

/// Pull-based audio callback handed to the transport.
///
/// Each call returns exactly one frame, or `None` when nothing is bound.
/// Implementations never block longer than one frame period.
pub trait FrameProducer: Send + Sync {
    fn pull(&self) -> Option<Frame>;
}

/// Black-box voice transport
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    /// Look up a channel and the group it belongs to
    async fn resolve_channel(&self, channel: ChannelId) -> Result<ChannelInfo, TransportError>;

    /// Join a channel. Fails with `AlreadyConnected` when the group already
    /// has a session.
    async fn connect(&self, channel: &ChannelInfo) -> Result<SessionId, TransportError>;

    async fn disconnect(&self, session: SessionId) -> Result<(), TransportError>;

    /// Start pulling frames from `producer`. Fails with `AlreadyPlaying` when
    /// a previous producer has not been stopped yet.
    fn play(&self, session: SessionId, producer: Arc<dyn FrameProducer>) -> Result<(), TransportError>;

    fn stop(&self, session: SessionId) -> Result<(), TransportError>;

    fn is_connected(&self, session: SessionId) -> bool;

    fn is_playing(&self, session: SessionId) -> bool;

    /// The session this process holds in `group`, if any
    fn existing_session(&self, group: GroupId) -> Option<SessionId>;

    /// Channel a session is currently bound to
    fn session_channel(&self, session: SessionId) -> Option<ChannelId>;

    fn latency(&self, session: SessionId) -> Option<Duration>;

    /// Other members present in the session's channel
    fn peer_count(&self, session: SessionId) -> usize;
}
