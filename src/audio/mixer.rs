//! Software playback graph
//!
//! Every decoded inbound chunk becomes a source scheduled at an absolute
//! output-clock time. The speaker callback pulls mono blocks out of
//! [`Mixer::render`], which sums the sources overlapping the block, applies
//! the single output gain and advances the clock. Each rendered block is also
//! teed to the recorder's agent track.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::resample::resample;
use crate::codec::AudioChunk;

/// Handle to a scheduled source
pub type SourceId = u64;

/// What the playback controller needs from the output side
///
/// The mixer is the production implementation; tests can substitute a
/// recording fake.
pub trait OutputGraph: Send + Sync {
    /// Output clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to start at output time `at`
    fn start_source(&self, chunk: AudioChunk, at: f64) -> SourceId;

    /// Stop a source immediately (no-op if it already finished)
    fn stop_source(&self, id: SourceId);
}

struct ScheduledSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerInner {
    frames_rendered: u64,
    gain: f32,
    next_id: SourceId,
    sources: Vec<ScheduledSource>,
    tap: Option<mpsc::Sender<Vec<f32>>>,
    detached: bool,
}

/// Mono mixer clocked by the frames it has rendered
pub struct Mixer {
    sample_rate: u32,
    inner: Mutex<MixerInner>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(MixerInner {
                frames_rendered: 0,
                gain: 1.0,
                next_id: 1,
                sources: Vec::new(),
                tap: None,
                detached: false,
            }),
        }
    }

    pub fn shared(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self::new(sample_rate))
    }

    fn lock(&self) -> MutexGuard<'_, MixerInner> {
        // A panic on the audio thread must not wedge teardown
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Send every rendered block to `tap` (the recorder's agent track)
    pub fn attach_tap(&self, tap: mpsc::Sender<Vec<f32>>) {
        self.lock().tap = Some(tap);
    }

    pub fn set_gain(&self, gain: f32) {
        self.lock().gain = gain.max(0.0);
    }

    pub fn active_sources(&self) -> usize {
        self.lock().sources.len()
    }

    /// Drop all sources and the tap; subsequent renders produce silence
    pub fn detach(&self) {
        let mut inner = self.lock();
        inner.sources.clear();
        inner.tap = None;
        inner.detached = true;
    }

    /// Fill `out` with the next block of mono output
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);

        let mut inner = self.lock();
        if inner.detached {
            return;
        }

        let block_start = inner.frames_rendered;
        let block_end = block_start + out.len() as u64;

        for source in &inner.sources {
            let from = source.start_frame.max(block_start);
            let to = source.end_frame().min(block_end);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let src_idx = (frame - source.start_frame) as usize;
                let out_idx = (frame - block_start) as usize;
                out[out_idx] += source.samples[src_idx];
            }
        }

        let gain = inner.gain;
        for sample in out.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }

        inner.sources.retain(|s| s.end_frame() > block_end);
        inner.frames_rendered = block_end;

        if let Some(tap) = &inner.tap {
            // Recorder falling behind loses agent audio rather than stalling the speaker
            let _ = tap.try_send(out.to_vec());
        }
    }
}

impl OutputGraph for Mixer {
    fn current_time(&self) -> f64 {
        self.lock().frames_rendered as f64 / self.sample_rate as f64
    }

    fn start_source(&self, chunk: AudioChunk, at: f64) -> SourceId {
        let samples = if chunk.sample_rate == self.sample_rate {
            chunk.samples
        } else {
            resample(&chunk.samples, chunk.sample_rate, self.sample_rate)
        };

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let requested = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(inner.frames_rendered);

        if !inner.detached {
            inner.sources.push(ScheduledSource {
                id,
                start_frame,
                samples,
            });
        }
        id
    }

    fn stop_source(&self, id: SourceId) {
        self.lock().sources.retain(|s| s.id != id);
    }
}
