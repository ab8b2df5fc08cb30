//! Sample rate conversion
//!
//! Device rates rarely match the wire (16kHz out, 24kHz in) so every graph
//! edge that crosses rates goes through a linear interpolator. The stateful
//! form carries its fractional position and last sample across callback
//! buffers, so block boundaries do not click.

/// Streaming linear resampler for mono f32 audio
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source step per output sample
    step: f64,
    /// Fractional read position relative to `prev`
    pos: f64,
    /// Last sample of the previous block (position -1 of the next one)
    prev: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            log::warn!(
                "Resampler: invalid sample rate (source: {}, target: {}), passing through",
                from_rate,
                to_rate
            );
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };

        Self {
            from_rate,
            to_rate,
            step,
            pos: 0.0,
            prev: None,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.step == 1.0
    }

    /// Convert one block, keeping interpolation state for the next
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }

        // Index 0 of `window` is the carried-over sample when we have one
        let offset = usize::from(self.prev.is_some());
        let sample_at = |i: usize| -> f32 {
            match (i, self.prev) {
                (0, Some(prev)) => prev,
                _ => input[i - offset],
            }
        };
        let available = input.len() + offset;

        let mut out = Vec::with_capacity((input.len() as f64 / self.step).ceil() as usize + 1);
        let mut pos = self.pos;

        while pos + 1.0 < available as f64 {
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = sample_at(idx);
            let b = sample_at(idx + 1);
            out.push(a + (b - a) * frac);
            pos += self.step;
        }

        // Re-anchor so the last input sample becomes position 0 of the next block
        let consumed = (available - 1) as f64;
        self.pos = pos - consumed;
        self.prev = input.last().copied();

        out
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// One-shot conversion of a complete buffer
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let mut resampler = LinearResampler::new(from_rate, to_rate);
    let mut out = resampler.process(samples);

    // Stateless callers want the tail sample too
    if !resampler.is_passthrough() {
        if let Some(&last) = samples.last() {
            let expected =
                (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
            while out.len() < expected {
                out.push(last);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_passes_through() {
        let input = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&input, 16000, 16000), input);

        let mut r = LinearResampler::new(16000, 16000);
        assert_eq!(r.process(&input), input);
    }

    #[test]
    fn zero_rate_passes_through() {
        let input = vec![0.5; 10];
        assert_eq!(resample(&input, 0, 16000), input);
    }

    #[test]
    fn downsample_length() {
        // 48kHz -> 16kHz is 3:1
        let input = vec![0.0; 4800];
        let out = resample(&input, 48000, 16000);
        assert_eq!(out.len(), 1600);
    }

    #[test]
    fn upsample_length() {
        // 16kHz -> 48kHz is 1:3
        let input = vec![0.0; 160];
        let out = resample(&input, 16000, 48000);
        assert_eq!(out.len(), 480);
    }

    #[test]
    fn upsample_interpolates() {
        let out = resample(&[0.0, 1.0], 1, 2);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let input: Vec<f32> = (0..9600).map(|i| (i as f32 * 0.01).sin()).collect();
        let whole = {
            let mut r = LinearResampler::new(48000, 16000);
            r.process(&input)
        };

        let mut r = LinearResampler::new(48000, 16000);
        let mut pieces = Vec::new();
        for block in input.chunks(441) {
            pieces.extend(r.process(block));
        }

        assert_eq!(whole.len(), pieces.len());
        for (a, b) in whole.iter().zip(&pieces) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn streaming_total_length_tracks_ratio() {
        let mut r = LinearResampler::new(44100, 16000);
        let mut produced = 0usize;
        for _ in 0..100 {
            produced += r.process(&[0.0; 441]).len();
        }
        // 44100 source samples -> ~16000 output samples
        assert!((produced as i64 - 16000).abs() <= 2, "produced {}", produced);
    }
}
