//! PCM16 wire codec
//!
//! Outbound audio is mono PCM16 little-endian at 16kHz, base64 framed and
//! tagged `audio/pcm;rate=16000`. Inbound audio is PCM16 at whatever rate the
//! provider puts in the mime type, possibly interleaved.
//!
//! Everything here is pure so it can be checked against golden byte vectors.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::SessionError;

/// Sample rate of the capture graph and of everything we send
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate assumed for inbound audio when the mime type carries none
pub const DEFAULT_INBOUND_SAMPLE_RATE: u32 = 24_000;

/// Mime type attached to every outbound blob
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// A base64-framed PCM16 payload as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBlob {
    /// Base64 (standard alphabet) of little-endian i16 samples
    pub data: String,
    pub mime_type: String,
}

/// One unit of decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Samples in [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert one float sample to PCM16, clamping to [-1, 1] first
pub fn float_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    // `as` saturates, so +1.0 lands on i16::MAX instead of wrapping
    (clamped * 32768.0).round() as i16
}

/// Encode float samples for the network
pub fn encode(samples: &[f32]) -> PcmBlob {
    let bytes: Vec<u8> = samples
        .iter()
        .flat_map(|&s| float_to_i16(s).to_le_bytes())
        .collect();

    PcmBlob {
        data: STANDARD.encode(&bytes),
        mime_type: CAPTURE_MIME_TYPE.to_string(),
    }
}

/// Decode a base64 PCM16 payload into one float vector per channel
pub fn decode(data: &str, channels: usize) -> Result<Vec<Vec<f32>>, SessionError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| SessionError::MalformedAudio(format!("invalid base64: {}", e)))?;
    decode_bytes(&bytes, channels)
}

/// Decode raw PCM16 little-endian bytes into one float vector per channel
pub fn decode_bytes(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>, SessionError> {
    if channels == 0 {
        return Err(SessionError::MalformedAudio(
            "channel count must be at least 1".to_string(),
        ));
    }

    let frame_width = 2 * channels;
    if bytes.len() % frame_width != 0 {
        return Err(SessionError::MalformedAudio(format!(
            "{} bytes is not a multiple of {} ({} channel(s) x 2 bytes)",
            bytes.len(),
            frame_width,
            channels
        )));
    }

    let frames = bytes.len() / frame_width;
    let mut out = vec![Vec::with_capacity(frames); channels];

    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(sample as f32 / 32768.0);
    }

    Ok(out)
}

/// Decode an inbound mono payload, taking the rate from its mime type
pub fn decode_chunk(data: &str, mime_type: &str) -> Result<AudioChunk, SessionError> {
    let sample_rate = sample_rate_from_mime(mime_type).unwrap_or(DEFAULT_INBOUND_SAMPLE_RATE);
    let mut channels = decode(data, 1)?;
    Ok(AudioChunk::new(channels.remove(0), sample_rate))
}

/// Extract `rate=N` from a mime type such as `audio/pcm;rate=24000`
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f32 = 1.0 / 32768.0;

    #[test]
    fn encode_golden_bytes() {
        let blob = encode(&[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");

        let bytes = STANDARD.decode(&blob.data).unwrap();
        // 0 -> 0x0000, 0.5 -> 0x4000, -0.5 -> 0xC000, -1.0 -> 0x8000
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0x00, 0x80]);
    }

    #[test]
    fn encode_clamps_out_of_range() {
        assert_eq!(float_to_i16(1.0), i16::MAX);
        assert_eq!(float_to_i16(3.5), i16::MAX);
        assert_eq!(float_to_i16(-1.0), i16::MIN);
        assert_eq!(float_to_i16(-7.0), i16::MIN);
    }

    #[test]
    fn round_trip_within_one_step() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.97)
            .chain([1.0, -1.0, 0.0, 1.5, -2.0])
            .collect();

        let blob = encode(&samples);
        let decoded = decode(&blob.data, 1).unwrap().remove(0);

        assert_eq!(decoded.len(), samples.len());
        for (original, back) in samples.iter().zip(&decoded) {
            let expected = original.clamp(-1.0, 1.0);
            assert!(
                (expected - back).abs() <= STEP,
                "{} decoded as {}",
                original,
                back
            );
        }
    }

    #[test]
    fn decode_deinterleaves_stereo() {
        // L: 0x4000, R: 0xC000, L: 0x0000, R: 0x7FFF
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0x00, 0x00, 0xFF, 0x7F];
        let channels = decode_bytes(&bytes, 2).unwrap();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0], vec![0.5, 0.0]);
        assert_eq!(channels[1], vec![-0.5, 32767.0 / 32768.0]);
    }

    #[test]
    fn decode_rejects_odd_length() {
        let err = decode_bytes(&[0x00, 0x40, 0x00], 1).unwrap_err();
        assert!(matches!(err, SessionError::MalformedAudio(_)));

        // 6 bytes is fine for mono but not for stereo
        assert!(decode_bytes(&[0; 6], 1).is_ok());
        assert!(decode_bytes(&[0; 6], 2).is_err());
    }

    #[test]
    fn decode_rejects_zero_channels_and_bad_base64() {
        assert!(decode_bytes(&[0; 4], 0).is_err());
        assert!(matches!(
            decode("not base64!!", 1),
            Err(SessionError::MalformedAudio(_))
        ));
    }

    #[test]
    fn mime_rate_parsing() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(sample_rate_from_mime("audio/pcm"), None);
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn decode_chunk_defaults_rate() {
        let blob = encode(&[0.25; 240]);
        let chunk = decode_chunk(&blob.data, "audio/pcm").unwrap();
        assert_eq!(chunk.sample_rate, DEFAULT_INBOUND_SAMPLE_RATE);
        assert!((chunk.duration_secs() - 0.01).abs() < 1e-9);

        let chunk = decode_chunk(&blob.data, "audio/pcm;rate=48000").unwrap();
        assert_eq!(chunk.sample_rate, 48000);
    }
}
