//! Frame source: one capture device binding producing fixed 20 ms frames
//!
//! A `FrameSource` keeps its identity across device switches; only the
//! native handle behind it is replaced, and the old handle is always closed
//! before the new one opens.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::device::{CaptureBackend, CaptureDevice, CaptureHandle, StreamFormat};
use crate::config::CaptureConfig;
use crate::constants::{FRAME_BYTES, FRAME_SAMPLES};
use crate::error::AudioError;

/// One frame of interleaved stereo signed 16-bit little-endian PCM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &sample in samples {
            buf.put_i16_le(sample);
        }
        Self { data: buf.freeze() }
    }

    /// A full frame of digital silence
    pub fn silence() -> Self {
        Self {
            data: Bytes::from(vec![0u8; FRAME_BYTES]),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Root-mean-square amplitude of a frame on the 16-bit scale
pub fn audio_level(frame: &Frame) -> f32 {
    let mut count = 0usize;
    let mut sum = 0f64;
    for sample in frame.samples() {
        let s = sample as f64;
        sum += s * s;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt() as f32
}

/// Decides when an audio-activity line may be logged
#[derive(Debug, Clone)]
pub struct ActivityMeter {
    noise_floor: f32,
    interval_frames: u64,
    last_report_frame: u64,
}

impl ActivityMeter {
    pub fn new(noise_floor: f32, interval_frames: u64) -> Self {
        Self {
            noise_floor,
            interval_frames: interval_frames.max(1),
            last_report_frame: 0,
        }
    }

    /// Record frame number `frame_count` with level `rms`. Returns true when
    /// a report should be emitted for it.
    pub fn observe(&mut self, frame_count: u64, rms: f32) -> bool {
        if rms <= self.noise_floor {
            return false;
        }
        if frame_count.saturating_sub(self.last_report_frame) < self.interval_frames {
            return false;
        }
        self.last_report_frame = frame_count;
        true
    }

    pub fn reset(&mut self) {
        self.last_report_frame = 0;
    }

    pub fn last_report_frame(&self) -> u64 {
        self.last_report_frame
    }
}

struct SourceState {
    device: Option<CaptureDevice>,
    handle: Option<Box<dyn CaptureHandle>>,
    frame_count: u64,
    opened_at: Instant,
    meter: ActivityMeter,
    scratch: Vec<i16>,
    latest: Option<Frame>,
}

/// Owns one open capture device and serves frames on demand
pub struct FrameSource {
    backend: Arc<dyn CaptureBackend>,
    config: CaptureConfig,
    state: Mutex<SourceState>,
}

impl FrameSource {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: CaptureConfig) -> Self {
        let meter = ActivityMeter::new(config.noise_floor, config.report_interval_frames);
        Self {
            backend,
            config,
            state: Mutex::new(SourceState {
                device: None,
                handle: None,
                frame_count: 0,
                opened_at: Instant::now(),
                meter,
                scratch: vec![0; FRAME_SAMPLES],
                latest: None,
            }),
        }
    }

    /// Open `device`, closing any previously open handle first
    pub fn open(&self, device: &CaptureDevice) -> Result<(), AudioError> {
        let mut state = self.state.lock();

        if let Some(mut old) = state.handle.take() {
            old.close();
            tracing::info!(
                from = state.device.as_ref().map(|d| d.id),
                to = device.id,
                "switching capture device"
            );
        }
        state.device = None;
        state.latest = None;

        let format = StreamFormat {
            queue_capacity: self.config.queue_capacity,
            ..StreamFormat::default()
        };
        let handle = self.backend.open(device, format)?;

        state.handle = Some(handle);
        state.device = Some(device.clone());
        state.frame_count = 0;
        state.opened_at = Instant::now();
        state.meter.reset();
        Ok(())
    }

    /// `open` on the blocking pool. Starting a device stream can take
    /// seconds and must not stall the async workers.
    pub async fn open_async(self: &Arc<Self>, device: &CaptureDevice) -> Result<(), AudioError> {
        let source = self.clone();
        let device = device.clone();
        tokio::task::spawn_blocking(move || source.open(&device))
            .await
            .unwrap_or_else(|e| Err(AudioError::Backend(format!("device open task failed: {e}"))))
    }

    /// Stop and release the device, if any
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut handle) = state.handle.take() {
            handle.close();
            tracing::debug!(device = state.device.as_ref().map(|d| d.id), "capture device released");
        }
        state.device = None;
        state.latest = None;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    pub fn device(&self) -> Option<CaptureDevice> {
        self.state.lock().device.clone()
    }

    /// Frames read since the device was opened
    pub fn frame_count(&self) -> u64 {
        self.state.lock().frame_count
    }

    /// Read one frame. `Ok(None)` when no device is open. A failed read leaves
    /// the device open; the caller substitutes silence and tries again next tick.
    pub fn read_frame(&self) -> Result<Option<Frame>, AudioError> {
        let mut state = self.state.lock();
        self.read_locked(&mut state)
    }

    /// Read on behalf of one of several consumers sharing this source.
    ///
    /// `cursor` holds the last frame number this consumer received. When
    /// another consumer already pulled a frame this one has not seen, that
    /// frame is handed out again instead of reading a new one, so every
    /// consumer hears the same audio.
    pub fn read_shared(&self, cursor: &AtomicU64) -> Result<Option<Frame>, AudioError> {
        let mut state = self.state.lock();

        if state.handle.is_some() {
            let seen = cursor.load(Ordering::Relaxed);
            if state.frame_count > seen {
                if let Some(latest) = state.latest.clone() {
                    cursor.store(state.frame_count, Ordering::Relaxed);
                    return Ok(Some(latest));
                }
            }
        }

        let frame = self.read_locked(&mut state)?;
        cursor.store(state.frame_count, Ordering::Relaxed);
        Ok(frame)
    }

    fn read_locked(&self, state: &mut SourceState) -> Result<Option<Frame>, AudioError> {
        let handle = match state.handle.as_mut() {
            Some(handle) => handle,
            None => return Ok(None),
        };
        handle.read(&mut state.scratch, self.config.read_timeout())?;

        let frame = Frame::from_samples(&state.scratch);
        state.frame_count += 1;
        state.latest = Some(frame.clone());

        if self.config.activity_logging {
            let rms = audio_level(&frame);
            let frame_count = state.frame_count;
            if state.meter.observe(frame_count, rms) {
                tracing::info!(
                    rms = rms.round() as u32,
                    elapsed_secs = state.opened_at.elapsed().as_secs_f32(),
                    "audio activity detected"
                );
            }
        }

        Ok(Some(frame))
    }
}

/// Let go of a source reference. Dropping the last one joins the capture
/// thread, so that happens on the blocking pool.
pub async fn release_source(source: Arc<FrameSource>) {
    if Arc::strong_count(&source) > 1 {
        return;
    }
    if let Err(e) = tokio::task::spawn_blocking(move || drop(source)).await {
        tracing::warn!(error = %e, "capture release task failed");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Some(mut handle) = self.state.get_mut().handle.take() {
            handle.close();
        }
    }
}
