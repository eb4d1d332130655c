//! Band-limited resampling between chunk and output sample rates.

use std::str::FromStr;

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 1024;

/// Resampling quality preset. Configuration-level, never request-level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Cubic polynomial, fastest.
    Fast,
    /// Sinc interpolation, balanced.
    #[default]
    Normal,
    /// Long sinc kernel, slowest.
    High,
}

impl FromStr for ResampleQuality {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(ResampleQuality::Fast),
            "normal" => Ok(ResampleQuality::Normal),
            "high" => Ok(ResampleQuality::High),
            other => Err(format!("unknown resample quality '{other}'")),
        }
    }
}

pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample mono samples from `from_rate` to `to_rate`.
    pub fn resample(&self, samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
        if from_rate == to_rate || samples.is_empty() {
            return Ok(samples.to_vec());
        }
        let ratio = to_rate as f64 / from_rate as f64;

        match self.quality {
            ResampleQuality::Fast => {
                let mut resampler =
                    FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK_SIZE, 1)
                        .map_err(|e| Error::Internal(format!("resampler init: {e}")))?;
                process_chunks(&mut resampler, samples)
            }
            quality => {
                let sinc_len = if quality == ResampleQuality::High { 256 } else { 128 };
                let params = SincInterpolationParameters {
                    sinc_len,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: sinc_len,
                    window: WindowFunction::BlackmanHarris2,
                };
                let mut resampler =
                    SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)
                        .map_err(|e| Error::Internal(format!("resampler init: {e}")))?;
                process_chunks(&mut resampler, samples)
            }
        }
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(ResampleQuality::Normal)
    }
}

/// Feed fixed-size chunks through the resampler, zero-padding the tail.
fn process_chunks<R: RubatoResampler<f32>>(resampler: &mut R, samples: &[f32]) -> Result<Vec<f32>> {
    let mut output = Vec::with_capacity(samples.len());
    let mut pos = 0;

    while pos < samples.len() {
        let end = (pos + CHUNK_SIZE).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(CHUNK_SIZE, 0.0);

        let waves_in = vec![chunk];
        let waves_out = resampler
            .process(&waves_in, None)
            .map_err(|e| Error::Internal(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&waves_out[0]);

        pos += CHUNK_SIZE;
    }

    Ok(output)
}

/// Convenience wrapper using the default quality.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    Resampler::default().resample(samples, from_rate, to_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn same_rate_is_identity() {
        let samples = vec![0.5f32; 100];
        let out = resample(&samples, 24_000, 24_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn downsample_halves_length_approximately() {
        let samples = vec![0.0f32; 4800];
        let out = resample(&samples, 48_000, 24_000).unwrap();
        assert!(out.len() > 2000 && out.len() < 3000, "got {}", out.len());
    }

    #[test]
    fn upsample_preserves_sine_amplitude() {
        let samples: Vec<f32> = (0..4800)
            .map(|i| (2.0 * PI * 100.0 * i as f32 / 16_000.0).sin())
            .collect();
        let out = resample(&samples, 16_000, 24_000).unwrap();
        let peak = out.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        assert!(peak > 0.5, "sine should survive resampling, peak={peak}");
    }

    #[test]
    fn empty_input_stays_empty() {
        let out = resample(&[], 16_000, 24_000).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn fast_quality_works() {
        let samples = vec![0.25f32; 2048];
        let out = Resampler::new(ResampleQuality::Fast)
            .resample(&samples, 48_000, 24_000)
            .unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn quality_parses_from_str() {
        assert_eq!("high".parse::<ResampleQuality>().unwrap(), ResampleQuality::High);
        assert!("ultra".parse::<ResampleQuality>().is_err());
    }
}
