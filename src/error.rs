//! Error types for the voice bridge

use thiserror::Error;

use crate::audio::DeviceId;
use crate::connection::{ManagerId, Phase, Target};
use crate::transport::{ChannelId, GroupId};

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture subsystem errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("No capture devices found")]
    NoDevices,

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Device {id} unavailable: {reason}")]
    DeviceUnavailable { id: DeviceId, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture stream error: {0}")]
    StreamError(String),

    #[error("Capture read timed out")]
    ReadTimeout,

    #[error("Capture read failed: {0}")]
    ReadFailed(String),

    #[error("Capture backend error: {0}")]
    Backend(String),
}

impl AudioError {
    /// Errors that retrying the same device cannot fix
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            AudioError::NoDevices
                | AudioError::DeviceNotFound(_)
                | AudioError::DeviceUnavailable { .. }
                | AudioError::UnsupportedFormat(_)
        )
    }

    /// Errors a single read may produce without closing the device
    pub fn is_read_glitch(&self) -> bool {
        matches!(self, AudioError::ReadTimeout | AudioError::ReadFailed(_))
    }
}

/// Failures reported by the voice transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Already connected to a voice channel in this group")]
    AlreadyConnected,

    #[error("Already playing audio")]
    AlreadyPlaying,

    #[error("Not connected")]
    NotConnected,

    #[error("Timed out")]
    Timeout,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether another connect attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::PermissionDenied | TransportError::ChannelNotFound(_)
        )
    }
}

/// Group exclusivity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Group {group} is already claimed by connection {holder}")]
    AlreadyClaimed { group: GroupId, holder: ManagerId },
}

/// Errors terminating a connection request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Device(#[from] AudioError),

    #[error("{0}")]
    Coordination(#[from] CoordinationError),

    #[error("Gave up after {attempts} connect attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error("Playback could not be started after {attempts} attempts")]
    PlaybackFailed { attempts: u32 },

    #[error("Voice session lost")]
    SessionLost,

    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Connection closed")]
    Cancelled,

    #[error("No connection for {0}")]
    UnknownTarget(Target),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
