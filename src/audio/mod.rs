//! Audio pipeline for live sessions
//!
//! Capture (microphone -> meter -> frames -> wire), playback (mixer ->
//! speaker) and the two-track conversation recorder. Uses cpal for device
//! I/O and hound for WAV encoding.

mod capture;
mod devices;
mod meter;
mod mixer;
mod paths;
mod recorder;
pub mod resample;

use thiserror::Error;

pub use capture::{run_capture, CaptureControls, CaptureTap, CAPTURE_FRAME_SAMPLES};
pub use devices::{AudioDevices, CpalDevices, DeviceStream};
pub use meter::{block_level, VolumeLevel, VolumeMeter};
pub use mixer::{Mixer, OutputGraph, SourceId};
pub use paths::{generate_recording_path, recordings_dir};
pub use recorder::{mix_tracks, FinishedRecording, MixRecorder, RecorderInputs};

/// Errors from audio devices and the recorder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration: {0}")]
    NoSupportedConfig(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to create WAV file: {0}")]
    FileCreationFailed(String),
    #[error("Failed to write audio data: {0}")]
    WriteFailed(String),
}
