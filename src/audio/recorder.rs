//! Conversation recorder
//!
//! Collects two mono tracks at the mix rate: the user's microphone (fed by
//! the capture tap) and the agent's rendered output (teed from the mixer).
//! Both start at the same instant and are produced in real time, so mixing
//! is a sample-wise sum. The result is written as a 16-bit mono WAV with
//! hound.

use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::AudioError;
use crate::codec::float_to_i16;

/// Buffered blocks per track before the producers start dropping
const TRACK_CHANNEL_CAPACITY: usize = 256;

/// Senders for the two recorder tracks
pub struct RecorderInputs {
    pub user: mpsc::Sender<Vec<f32>>,
    pub agent: mpsc::Sender<Vec<f32>>,
}

#[derive(Default)]
struct Tracks {
    user: Vec<f32>,
    agent: Vec<f32>,
}

/// Handle to an active recording
pub struct MixRecorder {
    sample_rate: u32,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Tracks>>,
}

impl MixRecorder {
    /// Start collecting both tracks at `sample_rate`
    pub fn start(sample_rate: u32) -> (Self, RecorderInputs) {
        let (user_tx, mut user_rx) = mpsc::channel::<Vec<f32>>(TRACK_CHANNEL_CAPACITY);
        let (agent_tx, mut agent_rx) = mpsc::channel::<Vec<f32>>(TRACK_CHANNEL_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut tracks = Tracks::default();

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    Some(block) = user_rx.recv() => tracks.user.extend(block),
                    Some(block) = agent_rx.recv() => tracks.agent.extend(block),
                    else => break,
                }
            }

            // Whatever was already queued belongs to the recording
            while let Ok(block) = user_rx.try_recv() {
                tracks.user.extend(block);
            }
            while let Ok(block) = agent_rx.try_recv() {
                tracks.agent.extend(block);
            }

            tracks
        });

        log::info!("Recorder: started at {}Hz", sample_rate);

        (
            Self {
                sample_rate,
                stop_tx: Some(stop_tx),
                task: Some(task),
            },
            RecorderInputs {
                user: user_tx,
                agent: agent_tx,
            },
        )
    }

    /// Stop collecting and mix the tracks
    pub async fn stop(mut self) -> Result<FinishedRecording, AudioError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let task = self
            .task
            .take()
            .ok_or_else(|| AudioError::WriteFailed("recorder already stopped".to_string()))?;

        let tracks = task
            .await
            .map_err(|e| AudioError::WriteFailed(format!("recorder task failed: {}", e)))?;

        let samples = mix_tracks(&tracks.user, &tracks.agent);
        log::info!(
            "Recorder: stopped ({} user + {} agent samples -> {} mixed)",
            tracks.user.len(),
            tracks.agent.len(),
            samples.len()
        );

        Ok(FinishedRecording {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

impl Drop for MixRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sum two tracks sample-wise, clamping to [-1, 1]
pub fn mix_tracks(a: &[f32], b: &[f32]) -> Vec<f32> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let sum = a.get(i).copied().unwrap_or(0.0) + b.get(i).copied().unwrap_or(0.0);
            sum.clamp(-1.0, 1.0)
        })
        .collect()
}

/// Mixed mono audio ready to be written
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl FinishedRecording {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Write a 16-bit mono WAV (blocking)
    pub fn write_wav(&self, path: &Path) -> Result<(), AudioError> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec)
            .map_err(|e| AudioError::FileCreationFailed(e.to_string()))?;

        for &sample in &self.samples {
            writer
                .write_sample(float_to_i16(sample))
                .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| AudioError::WriteFailed(e.to_string()))?;

        log::info!("Recorder: WAV finalized: {:?}", path);
        Ok(())
    }

    /// Write the WAV on the blocking pool
    pub async fn save(self, path: PathBuf) -> Result<PathBuf, AudioError> {
        tokio::task::spawn_blocking(move || self.write_wav(&path).map(|()| path))
            .await
            .map_err(|e| AudioError::WriteFailed(format!("writer task failed: {}", e)))?
    }
}
