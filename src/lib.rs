//! # Voice Bridge
//!
//! Resilient low-latency bridge from a local capture device into one or more
//! live voice channel sessions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          UI / CLI shell                                  │
//! │      request_connection · close_connection · snapshot · subscribe        │
//! └───────────────────────────────────┬──────────────────────────────────────┘
//!                                     │
//!                                     ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Bridge (bridge)                                │
//! │  ┌────────────────────┐   ┌────────────────────┐   ┌──────────────────┐  │
//! │  │ DeviceRegistry     │   │ CoordinationTable  │   │ FrameSources     │  │
//! │  │ (audio::device)    │   │ group -> manager   │   │ one per device   │  │
//! │  └────────────────────┘   └────────────────────┘   └──────────────────┘  │
//! │                                                                          │
//! │  ┌────────────────────────────┐     ┌────────────────────────────┐       │
//! │  │ ConnectionManager task     │     │ ConnectionManager task     │  ...  │
//! │  │  Idle → Connecting →       │     │  Idle → Connecting →       │       │
//! │  │  Connected ⇄ Degraded      │     │  Connected ⇄ Degraded      │       │
//! │  │  ReconnectPending → Closed │     │  ReconnectPending → Closed │       │
//! │  └─────────────┬──────────────┘     └─────────────┬──────────────┘       │
//! └────────────────┼──────────────────────────────────┼──────────────────────┘
//!                  │ play(session, producer)          │
//!                  ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │            Voice transport (black box, pulls one 20 ms frame per tick)   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::Bridge;
pub use error::{Error, Result};

/// Fixed PCM frame format shared by capture and transport
pub mod constants {
    /// Capture and transport sample rate
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Stereo
    pub const CHANNELS: u16 = 2;

    /// Duration of one frame, the transport's pull cadence
    pub const FRAME_DURATION_MS: u64 = 20;

    /// Frames per second at the pull cadence
    pub const FRAMES_PER_SECOND: u32 = 50;

    /// Samples per channel in one frame (samplerate / 50)
    pub const FRAME_SIZE: usize = (SAMPLE_RATE / FRAMES_PER_SECOND) as usize;

    /// Interleaved samples in one frame
    pub const FRAME_SAMPLES: usize = FRAME_SIZE * CHANNELS as usize;

    /// Bytes in one frame of signed 16-bit PCM
    pub const FRAME_BYTES: usize = FRAME_SAMPLES * std::mem::size_of::<i16>();

    /// Host API index treated as the default when filtering devices
    pub const DEFAULT_HOST_API: u32 = 0;
}
