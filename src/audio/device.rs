//! Capture device enumeration and the backend seam

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{CHANNELS, DEFAULT_HOST_API, SAMPLE_RATE};
use crate::error::AudioError;

/// Opaque capture device identifier (backend enumeration index)
pub type DeviceId = u32;

/// An enumerated capture device. Immutable; identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureDevice {
    /// Backend enumeration index
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Most input channels any supported config offers
    pub max_input_channels: u16,
    /// Host API the device is reached through
    pub host_api: u32,
}

/// Stream format requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Callback chunks buffered ahead of the reader
    pub queue_capacity: usize,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            queue_capacity: 64,
        }
    }
}

/// Platform capture backend
pub trait CaptureBackend: Send + Sync + 'static {
    /// List every input device the backend can see
    fn enumerate(&self) -> Result<Vec<CaptureDevice>, AudioError>;

    /// Open a capture stream on `device`
    fn open(
        &self,
        device: &CaptureDevice,
        format: StreamFormat,
    ) -> Result<Box<dyn CaptureHandle>, AudioError>;
}

/// An open capture stream
pub trait CaptureHandle: Send {
    /// Fill `out` with interleaved signed 16-bit samples, waiting at most
    /// `timeout` for the device
    fn read(&mut self, out: &mut [i16], timeout: Duration) -> Result<(), AudioError>;

    /// Stop the stream and release the device. Must not return until the
    /// device is released.
    fn close(&mut self);
}

/// Cached, filtered view of the backend's input devices
pub struct DeviceRegistry {
    backend: Arc<dyn CaptureBackend>,
    devices: Vec<CaptureDevice>,
}

impl DeviceRegistry {
    /// Enumerate the backend. Fails with `NoDevices` when no usable input
    /// device exists.
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Result<Self, AudioError> {
        let mut registry = Self {
            backend,
            devices: Vec::new(),
        };
        registry.refresh()?;
        Ok(registry)
    }

    /// Re-enumerate; previously returned devices are discarded
    pub fn refresh(&mut self) -> Result<(), AudioError> {
        let devices: Vec<CaptureDevice> = self
            .backend
            .enumerate()?
            .into_iter()
            .filter(|d| d.max_input_channels > 0 && d.host_api == DEFAULT_HOST_API)
            .collect();

        if devices.is_empty() {
            return Err(AudioError::NoDevices);
        }

        tracing::debug!(count = devices.len(), "enumerated capture devices");
        self.devices = devices;
        Ok(())
    }

    pub fn devices(&self) -> &[CaptureDevice] {
        &self.devices
    }

    pub fn get(&self, id: DeviceId) -> Result<&CaptureDevice, AudioError> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(AudioError::DeviceNotFound(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CaptureDevice> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Name to id mapping for selection lists
    pub fn options(&self) -> BTreeMap<String, DeviceId> {
        self.devices.iter().map(|d| (d.name.clone(), d.id)).collect()
    }

    pub fn backend(&self) -> Arc<dyn CaptureBackend> {
        self.backend.clone()
    }
}
