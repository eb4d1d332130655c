//! Audio buffers, WAV container handling, and output assembly.

mod resample;

pub use resample::{resample, ResampleQuality, Resampler};

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::config::EmptyChunkPolicy;
use crate::error::{Error, Result};

/// Mono waveform with samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Silence of the given length.
    pub fn silence(duration_ms: u64, sample_rate: u32) -> Self {
        let count = (sample_rate as u64 * duration_ms / 1000) as usize;
        Self::new(vec![0.0; count], sample_rate)
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Encode samples as a 16-bit signed PCM WAV container.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode WAV bytes into mono f32 samples plus the source rate. Multi-channel
/// input is averaged down to mono; non-finite samples are zeroed.
pub fn decode_wav_bytes(wav_bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let cursor = Cursor::new(wav_bytes);
    let mut reader = WavReader::new(cursor)
        .map_err(|e| Error::InvalidInput(format!("failed to parse WAV: {e}")))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels.max(1) as usize;

    let mut samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let bits = spec.bits_per_sample.max(1) as u32;
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| (s as f32 / max_val).clamp(-1.0, 1.0))
                .collect()
        }
        SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
    };

    if channels > 1 {
        let mut mono = Vec::with_capacity(samples.len() / channels + 1);
        for frame in samples.chunks(channels) {
            let sum: f32 = frame.iter().copied().sum();
            mono.push(sum / frame.len() as f32);
        }
        samples = mono;
    }

    for sample in &mut samples {
        if !sample.is_finite() {
            *sample = 0.0;
        } else {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    Ok((samples, sample_rate))
}

/// Concatenates per-chunk waveforms in emission order into one buffer at the
/// configured output rate, resampling chunks whose rate differs.
pub struct AudioAssembler {
    output_rate: u32,
    resampler: Resampler,
    empty_policy: EmptyChunkPolicy,
    samples: Vec<f32>,
    chunks: usize,
}

impl AudioAssembler {
    pub fn new(output_rate: u32, quality: ResampleQuality, empty_policy: EmptyChunkPolicy) -> Self {
        Self {
            output_rate,
            resampler: Resampler::new(quality),
            empty_policy,
            samples: Vec::new(),
            chunks: 0,
        }
    }

    /// Append one chunk's waveform.
    pub fn push_chunk(&mut self, chunk: AudioBuffer) -> Result<()> {
        self.chunks += 1;
        if chunk.sample_rate == self.output_rate {
            self.samples.extend_from_slice(&chunk.samples);
            return Ok(());
        }
        let converted = self
            .resampler
            .resample(&chunk.samples, chunk.sample_rate, self.output_rate)?;
        self.samples.extend(converted);
        Ok(())
    }

    /// Handle a chunk that produced no audio after its retry. Returns an
    /// error under the escalate policy, otherwise splices silence.
    pub fn push_empty_chunk(&mut self, chunk_index: usize) -> Result<()> {
        match self.empty_policy {
            EmptyChunkPolicy::Escalate => Err(Error::GenerationEmpty { chunk: chunk_index }),
            EmptyChunkPolicy::Splice { silence_ms } => {
                self.chunks += 1;
                let silence = AudioBuffer::silence(silence_ms, self.output_rate);
                self.samples.extend(silence.samples);
                Ok(())
            }
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> AudioBuffer {
        AudioBuffer::new(self.samples, self.output_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_round_trip_preserves_rate_and_length() {
        let samples: Vec<f32> = (0..2400).map(|i| (i as f32 / 2400.0).sin() * 0.5).collect();
        let bytes = encode_wav(&samples, 24_000).unwrap();
        let (decoded, rate) = decode_wav_bytes(&bytes).unwrap();
        assert_eq!(rate, 24_000);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 2.0 / i16::MAX as f32);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_wav_bytes(b"not a wav file").is_err());
    }

    #[test]
    fn assembler_concatenates_in_order() {
        let mut asm = AudioAssembler::new(
            24_000,
            ResampleQuality::Normal,
            EmptyChunkPolicy::Escalate,
        );
        asm.push_chunk(AudioBuffer::new(vec![0.1; 100], 24_000)).unwrap();
        asm.push_chunk(AudioBuffer::new(vec![0.2; 50], 24_000)).unwrap();
        assert_eq!(asm.chunks(), 2);
        let out = asm.finish();
        assert_eq!(out.len(), 150);
        assert!((out.samples[0] - 0.1).abs() < 1e-6);
        assert!((out.samples[100] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn assembler_resamples_mismatched_chunks() {
        let mut asm = AudioAssembler::new(
            24_000,
            ResampleQuality::Fast,
            EmptyChunkPolicy::Escalate,
        );
        asm.push_chunk(AudioBuffer::new(vec![0.0; 4800], 48_000)).unwrap();
        let out = asm.finish();
        assert_eq!(out.sample_rate, 24_000);
        // Half the input rate, within a chunk-boundary tolerance.
        assert!(out.len() > 2000 && out.len() < 3000, "got {}", out.len());
    }

    #[test]
    fn empty_chunk_escalates_by_default() {
        let mut asm = AudioAssembler::new(
            24_000,
            ResampleQuality::Normal,
            EmptyChunkPolicy::Escalate,
        );
        let err = asm.push_empty_chunk(3).unwrap_err();
        assert_eq!(err.kind(), "GenerationEmpty");
    }

    #[test]
    fn empty_chunk_splices_configured_silence() {
        let mut asm = AudioAssembler::new(
            24_000,
            ResampleQuality::Normal,
            EmptyChunkPolicy::Splice { silence_ms: 100 },
        );
        asm.push_empty_chunk(0).unwrap();
        let out = asm.finish();
        assert_eq!(out.len(), 2400);
        assert!(out.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn silence_has_exact_length() {
        let buf = AudioBuffer::silence(250, 24_000);
        assert_eq!(buf.len(), 6000);
        assert!((buf.duration_secs() - 0.25).abs() < 1e-9);
    }
}
