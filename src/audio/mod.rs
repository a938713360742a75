//! Audio capture subsystem

pub mod buffer;
#[cfg(feature = "capture-cpal")]
pub mod capture;
pub mod device;
pub mod source;

#[cfg(feature = "capture-cpal")]
pub use capture::CpalBackend;
pub use device::{CaptureBackend, CaptureDevice, CaptureHandle, DeviceId, DeviceRegistry, StreamFormat};
pub use source::{audio_level, release_source, ActivityMeter, Frame, FrameSource};
