//! Audio device boundary
//!
//! [`AudioDevices`] is the only place the session touches real hardware.
//! The cpal implementation opens the default input and output devices.
//! `cpal::Stream` is not `Send`, so each stream is built, played and dropped
//! on its own thread; the returned [`DeviceStream`] only holds a way to tell
//! that thread to stop.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use super::mixer::Mixer;
use super::AudioError;

/// An open device stream; stopping is idempotent and also happens on drop
pub struct DeviceStream {
    label: &'static str,
    sample_rate: u32,
    release: Mutex<Option<Release>>,
}

type Release = Box<dyn FnOnce() + Send>;

impl DeviceStream {
    pub fn new(
        label: &'static str,
        sample_rate: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            label,
            sample_rate,
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_stopped(&self) -> bool {
        self.release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn stop(&mut self) {
        let release = self
            .release
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release();
            log::info!("Audio: {} stream stopped", self.label);
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hardware the session needs
pub trait AudioDevices: Send + Sync {
    /// Open the microphone; mono blocks at the device rate go to `tx`
    fn open_input(&self, tx: mpsc::Sender<Vec<f32>>) -> Result<DeviceStream, AudioError>;

    /// Rate the output device will run at (the mixer is built at this rate)
    fn output_sample_rate(&self) -> Result<u32, AudioError>;

    /// Open the speaker, pulling mono blocks from `mixer`
    fn open_output(&self, mixer: Arc<Mixer>) -> Result<DeviceStream, AudioError>;
}

/// Default host devices via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn input_config() -> Result<(cpal::Device, StreamConfig, SampleFormat), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Audio: using input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;

    log::info!(
        "Audio: input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let format = supported.sample_format();
    Ok((device, supported.into(), format))
}

fn output_config() -> Result<(cpal::Device, StreamConfig, SampleFormat), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Audio: using output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;

    let format = supported.sample_format();
    Ok((device, supported.into(), format))
}

/// Run `build` on a dedicated thread that owns the stream until released
fn spawn_stream_thread<B>(label: &'static str, build: B) -> Result<DeviceStream, AudioError>
where
    B: FnOnce() -> Result<(cpal::Stream, u32), AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let handle = thread::Builder::new()
        .name(format!("live-agent-{}", label))
        .spawn(move || {
            let stream = match build() {
                Ok((stream, rate)) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                            "Failed to start stream: {}",
                            e
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Park until released (or the handle is dropped)
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    let rate = ready_rx
        .recv()
        .map_err(|_| AudioError::StreamCreationFailed(format!("{} thread exited", label)))??;

    Ok(DeviceStream::new(label, rate, move || {
        let _ = stop_tx.send(());
        if handle.join().is_err() {
            log::warn!("Audio: {} thread panicked", label);
        }
    }))
}

impl AudioDevices for CpalDevices {
    fn open_input(&self, tx: mpsc::Sender<Vec<f32>>) -> Result<DeviceStream, AudioError> {
        spawn_stream_thread("input", move || {
            let (device, config, format) = input_config()?;
            let rate = config.sample_rate.0;
            let stream = match format {
                SampleFormat::I16 => build_input_typed::<i16>(&device, &config, tx),
                SampleFormat::U16 => build_input_typed::<u16>(&device, &config, tx),
                SampleFormat::F32 => build_input_typed::<f32>(&device, &config, tx),
                other => Err(AudioError::NoSupportedConfig(format!("{:?}", other))),
            }?;
            Ok((stream, rate))
        })
    }

    fn output_sample_rate(&self) -> Result<u32, AudioError> {
        let (_, config, _) = output_config()?;
        Ok(config.sample_rate.0)
    }

    fn open_output(&self, mixer: Arc<Mixer>) -> Result<DeviceStream, AudioError> {
        spawn_stream_thread("output", move || {
            let (device, config, format) = output_config()?;
            let rate = config.sample_rate.0;
            if rate != mixer.sample_rate() {
                log::warn!(
                    "Audio: output runs at {} Hz but mixer was built for {} Hz",
                    rate,
                    mixer.sample_rate()
                );
            }
            let stream = match format {
                SampleFormat::I16 => build_output_typed::<i16>(&device, &config, mixer),
                SampleFormat::U16 => build_output_typed::<u16>(&device, &config, mixer),
                SampleFormat::F32 => build_output_typed::<f32>(&device, &config, mixer),
                other => Err(AudioError::NoSupportedConfig(format!("{:?}", other))),
            }?;
            Ok((stream, rate))
        })
    }
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let err_fn = |err| log::error!("Audio: input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Downmix to mono
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>()
                            / frame.len() as f32
                    })
                    .collect();
                // Never block the audio thread
                let _ = tx.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = usize::from(config.channels.max(1));
    let err_fn = |err| log::error!("Audio: output stream error: {}", err);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0.0);
                mixer.render(&mut scratch);

                for (frame, &value) in data.chunks_mut(channels).zip(scratch.iter()) {
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn device_stream_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut stream = DeviceStream::new("test", 16000, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(stream.sample_rate(), 16000);
        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
        drop(stream);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_stream_releases_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        drop(DeviceStream::new("test", 16000, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn open_default_input() {
        let (tx, _rx) = mpsc::channel(16);
        let mut stream = CpalDevices::new().open_input(tx).unwrap();
        assert!(stream.sample_rate() > 0);
        stream.stop();
    }
}
