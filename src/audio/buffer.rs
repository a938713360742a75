//! PCM chunk queue between the capture callback and frame reads
//!
//! The device callback pushes whatever chunk size the OS delivers; the
//! reader side re-slices that stream into fixed-size frames.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::AudioError;

/// Create a bounded chunk queue holding at most `capacity` chunks
pub fn pcm_queue(capacity: usize) -> (ChunkSender, FrameAssembler) {
    let (tx, rx) = bounded(capacity.max(1));
    let overflow_count = Arc::new(AtomicUsize::new(0));

    (
        ChunkSender {
            tx,
            overflow_count: overflow_count.clone(),
        },
        FrameAssembler {
            rx,
            pending: VecDeque::new(),
            overflow_count,
            underrun_count: 0,
        },
    )
}

/// Producer half, owned by the device callback
#[derive(Clone)]
pub struct ChunkSender {
    tx: Sender<Vec<i16>>,
    overflow_count: Arc<AtomicUsize>,
}

impl ChunkSender {
    /// Push a chunk. Returns false when the queue is full and the chunk was
    /// dropped (overflow) or the reader is gone.
    pub fn push(&self, chunk: Vec<i16>) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Consumer half, re-slices chunks into frames
pub struct FrameAssembler {
    rx: Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    overflow_count: Arc<AtomicUsize>,
    underrun_count: usize,
}

impl FrameAssembler {
    /// Fill `out` completely, waiting at most `timeout` for more chunks.
    ///
    /// On timeout the samples gathered so far stay pending for the next
    /// call, so a late chunk is not lost.
    pub fn fill(&mut self, out: &mut [i16], timeout: Duration) -> Result<(), AudioError> {
        let deadline = Instant::now() + timeout;

        while self.pending.len() < out.len() {
            match self.rx.recv_deadline(deadline) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    self.underrun_count += 1;
                    return Err(AudioError::ReadTimeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::StreamError("capture stream ended".to_string()));
                }
            }
        }

        let wanted = out.len();
        for (slot, sample) in out.iter_mut().zip(self.pending.drain(..wanted)) {
            *slot = sample;
        }
        Ok(())
    }

    /// Drop everything buffered so far
    pub fn clear(&mut self) {
        self.pending.clear();
        while self.rx.try_recv().is_ok() {}
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count
    }

    pub fn reset_stats(&mut self) {
        self.overflow_count.store(0, Ordering::Relaxed);
        self.underrun_count = 0;
    }
}
