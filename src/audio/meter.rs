//! Microphone volume meter
//!
//! The capture tap feeds every microphone block through a [`VolumeMeter`];
//! the smoothed level (0-100) is published through a lock-free
//! [`VolumeLevel`] that the UI state loop reads without touching the audio
//! thread.

use std::sync::atomic::{AtomicU32, Ordering};

/// Mean absolute amplitude is scaled by this before clamping to 100
const LEVEL_SCALE: f32 = 5000.0;

/// Upper bound of the level scale
pub const MAX_LEVEL: f32 = 100.0;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Raw level for one block: `min(100, mean(|x|) * 5000)`
pub fn block_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_abs = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
    (mean_abs * LEVEL_SCALE).min(MAX_LEVEL)
}

/// Level shared between the audio thread and observers
///
/// Stored as the bit pattern of an f32 so reads and writes are single atomics.
#[derive(Debug, Default)]
pub struct VolumeLevel(AtomicU32);

impl VolumeLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// EMA-smoothed meter state, owned by the capture tap
#[derive(Debug, Default)]
pub struct VolumeMeter {
    smoothed: f32,
    initialized: bool,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one block and return the smoothed level
    pub fn push(&mut self, samples: &[f32]) -> f32 {
        let level = block_level(samples);
        if !self.initialized {
            // First block: use raw value as initial state
            self.smoothed = level;
            self.initialized = true;
        } else {
            self.smoothed = EMA_ALPHA * level + (1.0 - EMA_ALPHA) * self.smoothed;
        }
        self.smoothed
    }

    pub fn reset(&mut self) {
        self.smoothed = 0.0;
        self.initialized = false;
    }
}
