//! Status snapshots and the connection event stream

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::DeviceId;
use crate::connection::producer::SourceProducer;
use crate::connection::state::{ConnectionState, Phase, Target};
use crate::transport::VoiceTransport;

/// Read-only view of one connection, computed on demand
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Device and channel this connection bridges
    pub target: Target,
    /// Lifecycle phase at the time of the snapshot
    pub phase: Phase,
    /// Live phase and the transport reports the session connected
    pub connected: bool,
    /// Connected and the transport is pulling frames
    pub playing: bool,
    /// Frames are replaced with silence
    pub muted: bool,
    /// Resolved channel name, once connected
    pub channel_name: Option<String>,
    /// Time since the current session connected
    pub uptime: Option<Duration>,
    /// Wall-clock time the current session connected
    pub connected_since: Option<DateTime<Utc>>,
    /// A capture device is open behind the frame producer
    pub has_stream: bool,
    /// Connect attempts in the current cycle
    pub attempt: u32,
    /// Connect cycles started after a lost session
    pub restarts: u32,
    /// Most recent failure, if any
    pub last_error: Option<String>,
}

/// Builds snapshots for one connection from any task or thread
#[derive(Clone)]
pub struct StatusReporter {
    state: Arc<Mutex<ConnectionState>>,
    transport: Arc<dyn VoiceTransport>,
    producer: Arc<SourceProducer>,
}

impl StatusReporter {
    pub(crate) fn new(
        state: Arc<Mutex<ConnectionState>>,
        transport: Arc<dyn VoiceTransport>,
        producer: Arc<SourceProducer>,
    ) -> Self {
        Self {
            state,
            transport,
            producer,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        // Copy the record under the lock so the fields agree with each other
        let state = self.state.lock().clone();

        let session = state.session.filter(|_| state.phase.is_live());
        let connected = session.map_or(false, |s| self.transport.is_connected(s));
        let playing = connected && session.map_or(false, |s| self.transport.is_playing(s));

        StatusSnapshot {
            target: state.target,
            phase: state.phase,
            connected,
            playing,
            muted: self.producer.is_muted(),
            channel_name: state.channel_name,
            uptime: state.connected_at.map(|at| at.elapsed()),
            connected_since: state.connected_since,
            has_stream: self.producer.has_stream(),
            attempt: state.attempt,
            restarts: state.restarts,
            last_error: state.last_error.map(|e| e.to_string()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }
}

/// Something that happened to a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    /// Connection the event belongs to
    pub target: Target,
    /// When the event was emitted
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl ConnectionEvent {
    pub fn new(target: Target, kind: EventKind) -> Self {
        Self {
            target,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    PhaseChanged { from: Phase, to: Phase },
    AttemptFailed { attempt: u32, error: String },
    PlaybackRestarted,
    DeviceSwitched { device: DeviceId },
    MuteChanged { muted: bool },
    /// The connection ended; `reason` is set when it ended on a fatal error
    Closed { reason: Option<String> },
    Status {
        uptime: Duration,
        peers: usize,
        latency: Option<Duration>,
    },
}
