//! Per-target connection state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

use crate::audio::DeviceId;
use crate::error::ConnectionError;
use crate::transport::{ChannelId, SessionId};

/// A (device, channel) pair a caller wants bridged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub device: DeviceId,
    pub channel: ChannelId,
}

impl Target {
    pub fn new(device: DeviceId, channel: ChannelId) -> Self {
        Self { device, channel }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} -> channel {}", self.device, self.channel)
    }
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    /// Connected, but audio production is stalled or being repaired
    Degraded,
    ReconnectPending,
    Closed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self == Phase::Closed
    }

    /// Connected to the transport, whether or not audio is flowing
    pub fn is_live(self) -> bool {
        matches!(self, Phase::Connected | Phase::Degraded)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;

        match (self, next) {
            (Closed, _) => false,
            // Explicit close or fatal error from any live phase
            (_, Closed) => true,
            (Idle, Connecting) => true,
            // Retry after backoff
            (Connecting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, ReconnectPending) => true,
            (Connected, Degraded) => true,
            (Degraded, Connected) => true,
            (Degraded, ReconnectPending) => true,
            (ReconnectPending, Connecting) => true,
            _ => false,
        }
    }
}

/// Mutable record for one target. Only the owning manager task writes it.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub target: Target,
    pub phase: Phase,
    /// Connect attempts made in the current connect cycle
    pub attempt: u32,
    /// Most recent failure; kept after recovery for status display
    pub last_error: Option<ConnectionError>,
    /// Monotonic connect time of the live session, for uptime
    pub connected_at: Option<Instant>,
    /// Wall-clock connect time of the live session
    pub connected_since: Option<DateTime<Utc>>,
    /// Transport session while live
    pub session: Option<SessionId>,
    /// Resolved channel name, set on connect
    pub channel_name: Option<String>,
    /// Completed connect cycles after the first
    pub restarts: u32,
}

impl ConnectionState {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            phase: Phase::Idle,
            attempt: 0,
            last_error: None,
            connected_at: None,
            connected_since: None,
            session: None,
            channel_name: None,
            restarts: 0,
        }
    }

    /// Move to `next`, rejecting transitions the machine does not allow
    pub fn transition(&mut self, next: Phase) -> Result<Phase, ConnectionError> {
        let from = self.phase;
        if !from.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition { from, to: next });
        }

        self.phase = next;
        match next {
            Phase::Connected => {
                self.attempt = 0;
                if !from.is_live() {
                    self.connected_at = Some(Instant::now());
                    self.connected_since = Some(Utc::now());
                }
            }
            Phase::ReconnectPending | Phase::Closed => {
                self.connected_at = None;
                self.connected_since = None;
                self.session = None;
            }
            _ => {}
        }
        Ok(from)
    }

    pub fn record_error(&mut self, error: ConnectionError) {
        self.last_error = Some(error);
    }
}
