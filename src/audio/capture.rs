//! cpal capture backend
//!
//! Each open device runs its stream on a dedicated thread, since cpal
//! streams are not `Send` on every host. The data callback forwards raw
//! chunks into a bounded queue that frame reads drain.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{pcm_queue, FrameAssembler};
use crate::audio::device::{CaptureBackend, CaptureDevice, CaptureHandle, StreamFormat};
use crate::constants::DEFAULT_HOST_API;
use crate::error::AudioError;

/// How long `open` waits for the capture thread to report the stream started
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Capture backend over the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for CpalBackend {
    fn enumerate(&self) -> Result<Vec<CaptureDevice>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Backend(e.to_string()))?;

        let mut list = Vec::new();
        for (index, device) in devices.enumerate() {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let max_input_channels = device
                .supported_input_configs()
                .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
                .unwrap_or(0);

            list.push(CaptureDevice {
                id: index as u32,
                name,
                max_input_channels,
                host_api: DEFAULT_HOST_API,
            });
        }

        Ok(list)
    }

    fn open(
        &self,
        device: &CaptureDevice,
        format: StreamFormat,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let capture = CpalCapture::start(device.clone(), format)?;
        Ok(Box::new(capture))
    }
}

/// Find the cpal device behind an enumerated id, checking it is still the
/// same device
fn find_input_device(device: &CaptureDevice) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let mut devices = host
        .input_devices()
        .map_err(|e| AudioError::Backend(e.to_string()))?;

    let found = devices
        .nth(device.id as usize)
        .ok_or(AudioError::DeviceNotFound(device.id))?;

    match found.name() {
        Ok(name) if name == device.name => Ok(found),
        Ok(name) => Err(AudioError::DeviceUnavailable {
            id: device.id,
            reason: format!("device list changed, index now names {:?}", name),
        }),
        Err(e) => Err(AudioError::DeviceUnavailable {
            id: device.id,
            reason: e.to_string(),
        }),
    }
}

/// One open cpal input stream
pub struct CpalCapture {
    /// Device this stream was opened on
    device: CaptureDevice,
    /// Cleared to stop the capture thread
    running: Arc<AtomicBool>,
    /// Capture thread; owns the cpal stream
    thread_handle: Option<JoinHandle<()>>,
    /// Reader side of the chunk queue
    assembler: FrameAssembler,
    /// Errors reported by the stream's error callback
    stream_errors: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Start capturing; returns once the stream is playing or failed to start
    pub fn start(device: CaptureDevice, format: StreamFormat) -> Result<Self, AudioError> {
        let (chunk_tx, assembler) = pcm_queue(format.queue_capacity);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let stream_errors = Arc::new(AtomicU64::new(0));
        let errors_for_callback = stream_errors.clone();

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let thread_device = device.clone();

        let handle = thread::Builder::new()
            .name(format!("capture-device-{}", device.id))
            .spawn(move || {
                let cpal_device = match find_input_device(&thread_device) {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        chunk_tx.push(data.to_vec());
                    },
                    move |err| {
                        errors_for_callback.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("capture stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceUnavailable {
                            id: thread_device.id,
                            reason: e.to_string(),
                        }));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable {
                        id: thread_device.id,
                        reason: e.to_string(),
                    }));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, releasing the device
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let mut capture = Self {
            device,
            running,
            thread_handle: Some(handle),
            assembler,
            stream_errors,
        };

        let started = ready_rx
            .recv_timeout(STREAM_START_TIMEOUT)
            .unwrap_or_else(|_| {
                Err(AudioError::DeviceUnavailable {
                    id: capture.device.id,
                    reason: "stream did not start".to_string(),
                })
            });

        match started {
            Ok(()) => {
                tracing::info!(device = capture.device.id, name = %capture.device.name, "capture stream started");
                Ok(capture)
            }
            Err(e) => {
                capture.close();
                Err(e)
            }
        }
    }

    pub fn device(&self) -> &CaptureDevice {
        &self.device
    }

    pub fn stream_errors(&self) -> u64 {
        self.stream_errors.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl CaptureHandle for CpalCapture {
    fn read(&mut self, out: &mut [i16], timeout: Duration) -> Result<(), AudioError> {
        self.assembler.fill(out, timeout)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!(
                device = self.device.id,
                overflows = self.assembler.overflow_count(),
                underruns = self.assembler.underrun_count(),
                stream_errors = self.stream_errors(),
                "capture stream closed"
            );
        }
        self.assembler.clear();
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}
