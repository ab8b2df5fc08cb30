//! Microphone capture graph
//!
//! ```text
//! Audio Thread (sync)            Tokio Runtime (async)
//! ┌──────────────────┐           ┌───────────────────────────────┐
//! │ input callback   │──channel─▶│ run_capture()                 │
//! │ try_send(mono)   │           │   ├─ meter  -> VolumeLevel    │
//! └──────────────────┘           │   ├─ resample -> recorder     │
//!                                │   └─ resample -> 4096 frame   │
//!                                │        -> encode -> outbound  │
//!                                └───────────────────────────────┘
//! ```
//!
//! Mute and the outbound wire live in [`CaptureControls`], which the
//! session shares with the state machine's effects. Frames are only sent
//! once the session is live (outbound wired) and not muted; the meter and
//! the recording keep seeing the microphone either way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::meter::{VolumeLevel, VolumeMeter};
use super::resample::LinearResampler;
use crate::codec::{self, PcmBlob, CAPTURE_SAMPLE_RATE};

/// Samples per outbound frame at 16kHz (256ms)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Session-wide switches for the capture graph
#[derive(Debug, Default)]
pub struct CaptureControls {
    muted: AtomicBool,
    volume: Arc<VolumeLevel>,
    outbound: Mutex<Option<mpsc::Sender<PcmBlob>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl CaptureControls {
    pub fn new(volume: Arc<VolumeLevel>) -> Self {
        Self {
            volume,
            ..Default::default()
        }
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<PcmBlob>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start sending frames to `tx`
    pub fn wire(&self, tx: mpsc::Sender<PcmBlob>) {
        *self.outbound() = Some(tx);
        log::debug!("Capture: outbound wired");
    }

    /// Stop sending frames; dropping the sender ends the outbound loop
    pub fn unwire(&self) {
        if self.outbound().take().is_some() {
            log::debug!("Capture: outbound unwired");
        }
    }

    pub fn is_wired(&self) -> bool {
        self.outbound().is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> &Arc<VolumeLevel> {
        &self.volume
    }

    pub fn reset_volume(&self) {
        self.volume.reset();
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &[f32]) {
        if self.is_muted() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let guard = self.outbound();
        let Some(tx) = guard.as_ref() else {
            // Not live yet
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match tx.try_send(codec::encode(frame)) {
            Ok(()) => {
                let sent = self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                // Periodic logging (every 20 frames = ~5 seconds)
                if sent % 20 == 0 {
                    log::debug!("Capture: sent {} frames", sent);
                }
            }
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Capture: outbound frame dropped: {}", e);
            }
        }
    }
}

/// Per-session capture state: resamplers, frame buffer and meter
pub struct CaptureTap {
    controls: Arc<CaptureControls>,
    network: LinearResampler,
    recording: Option<(LinearResampler, mpsc::Sender<Vec<f32>>)>,
    frame: Vec<f32>,
    frame_samples: usize,
    meter: VolumeMeter,
}

impl CaptureTap {
    pub fn new(controls: Arc<CaptureControls>, device_rate: u32, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        log::info!(
            "Capture: {}Hz -> {}Hz, {} sample frames",
            device_rate,
            CAPTURE_SAMPLE_RATE,
            frame_samples
        );

        Self {
            controls,
            network: LinearResampler::new(device_rate, CAPTURE_SAMPLE_RATE),
            recording: None,
            frame: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            meter: VolumeMeter::new(),
        }
    }

    /// Also feed the microphone (at `mix_rate`) into the recorder's user track
    pub fn with_recording(mut self, mix_rate: u32, tx: mpsc::Sender<Vec<f32>>) -> Self {
        let device_rate = self.network.from_rate();
        self.recording = Some((LinearResampler::new(device_rate, mix_rate), tx));
        self
    }

    /// Handle one block of mono microphone samples at the device rate
    pub fn process(&mut self, block: &[f32]) {
        let level = self.meter.push(block);
        self.controls.volume.set(level);

        if let Some((resampler, tx)) = &mut self.recording {
            let _ = tx.try_send(resampler.process(block));
        }

        let resampled = self.network.process(block);
        if self.controls.is_muted() {
            // Muted audio never reaches the wire, not even as a partial frame later
            self.frame.clear();
            return;
        }

        self.frame.extend(resampled);
        while self.frame.len() >= self.frame_samples {
            let frame: Vec<f32> = self.frame.drain(..self.frame_samples).collect();
            self.controls.send_frame(&frame);
        }
    }

    /// Samples waiting for the next full frame
    pub fn buffered(&self) -> usize {
        self.frame.len()
    }
}

/// Drive the tap from the device channel until the input stream goes away
pub async fn run_capture(mut rx: mpsc::Receiver<Vec<f32>>, mut tap: CaptureTap) {
    log::info!("Capture: starting capture loop");

    let mut blocks = 0u64;
    while let Some(block) = rx.recv().await {
        tap.process(&block);
        blocks += 1;
    }

    log::info!(
        "Capture: loop ended after {} blocks ({} frames sent, {} dropped)",
        blocks,
        tap.controls.frames_sent(),
        tap.controls.frames_dropped()
    );
}
