//! Frame producer handed to the transport

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::{Frame, FrameSource};
use crate::transport::FrameProducer;

/// Pulls frames from the connection's current `FrameSource`.
///
/// Read glitches and mute both turn into silence so the transport keeps a
/// steady stream; only a missing device yields `None`.
pub struct SourceProducer {
    /// Current capture source; `None` once detached
    source: RwLock<Option<Arc<FrameSource>>>,
    /// Last frame number this consumer received from a shared source
    cursor: AtomicU64,
    muted: AtomicBool,
    /// Reads that fell back to silence
    glitches: AtomicU64,
}

impl SourceProducer {
    pub fn new(source: Arc<FrameSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
            cursor: AtomicU64::new(0),
            muted: AtomicBool::new(false),
            glitches: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> Option<Arc<FrameSource>> {
        self.source.read().clone()
    }

    /// Attach a different source, returning the previous one
    pub fn replace(&self, source: Arc<FrameSource>) -> Option<Arc<FrameSource>> {
        let previous = self.source.write().replace(source);
        self.cursor.store(0, Ordering::Relaxed);
        previous
    }

    /// Drop the source reference; the device closes once no connection uses it
    pub fn detach(&self) -> Option<Arc<FrameSource>> {
        self.source.write().take()
    }

    pub fn has_stream(&self) -> bool {
        self.source
            .read()
            .as_ref()
            .map_or(false, |source| source.is_open())
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Reads that fell back to silence
    pub fn glitches(&self) -> u64 {
        self.glitches.load(Ordering::Relaxed)
    }
}

impl FrameProducer for SourceProducer {
    fn pull(&self) -> Option<Frame> {
        let source = self.source()?;

        match source.read_shared(&self.cursor) {
            Ok(Some(_)) if self.is_muted() => Some(Frame::silence()),
            Ok(Some(frame)) => Some(frame),
            Ok(None) => None,
            Err(e) => {
                let count = self.glitches.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(error = %e, count, "capture read glitch, sending silence");
                Some(Frame::silence())
            }
        }
    }
}
