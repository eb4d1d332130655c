//! Deterministic CPU reference backend.
//!
//! Implements the model and codec seams with pure arithmetic: logits are
//! one-hot-shaped around a planned token stream derived from the prompt, and
//! the codec maps token frames to fixed-length sine segments. Output length
//! tracks the final user turn, so transcript size maps onto audio duration.
//! Everything is a pure function of the inputs, which gives the bit-identical
//! reruns the deterministic-mode contract requires.

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{
    CapturedGraph, GenerationModel, KvWorkspace, ModelLoader, SpeechCodec, StepLogits, TokenEvent,
    TokenMarkers, WorkspaceSpec,
};
use crate::prompt::{Role, Turn, TurnPayload};

const TEXT_VOCAB: usize = 3072;
const CODEBOOKS: usize = 8;
const CODEBOOK_VOCAB: usize = 1024;

const AUDIO_BEGIN_ID: u32 = 3000;
const EOS_ID: u32 = 3001;
/// Lives in codebook 0's alphabet.
const AUDIO_END_ID: u32 = (CODEBOOK_VOCAB - 1) as u32;

/// Role markers in the text alphabet.
const SYSTEM_ID: u32 = 2960;
const USER_ID: u32 = 2961;
const ASSISTANT_ID: u32 = 2962;
/// Audio-turn frames fold into this id range.
const AUDIO_TURN_BASE: u32 = 512;

/// Dominant logit for the planned token; overwhelms sampling noise at any
/// legal temperature.
const PEAK_LOGIT: f32 = 50.0;

/// Plan entries stored in workspace scratch.
const PLAN_BEGIN: u32 = u32::MAX;
const PLAN_END: u32 = u32::MAX - 1;
const PLAN_EOS: u32 = u32::MAX - 2;
/// scratch[0] = cursor, scratch[1..3] = context hash, plan follows.
const PLAN_OFFSET: usize = 3;

const MIN_FRAMES: usize = 4;
const MAX_FRAMES: usize = 600;

fn mix(hash: u64, value: u64) -> u64 {
    (hash ^ value).wrapping_mul(0x0000_0100_0000_01b3)
}

fn hash_ids(ids: &[u32]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &id in ids {
        hash = mix(hash, id as u64);
    }
    hash
}

struct ReferenceCore {
    device: Device,
}

impl ReferenceCore {
    fn text_logits(&self, target: u32) -> Result<Tensor> {
        let mut values = vec![0.0f32; TEXT_VOCAB];
        values[target as usize % TEXT_VOCAB] = PEAK_LOGIT;
        Ok(Tensor::from_vec(values, TEXT_VOCAB, &self.device)?)
    }

    fn audio_rows(&self, codes: &[u32]) -> Result<Vec<Tensor>> {
        let mut rows = Vec::with_capacity(codes.len());
        for &code in codes {
            let mut values = vec![0.0f32; CODEBOOK_VOCAB];
            values[code as usize % CODEBOOK_VOCAB] = PEAK_LOGIT;
            rows.push(Tensor::from_vec(values, CODEBOOK_VOCAB, &self.device)?);
        }
        Ok(rows)
    }

    /// Codebook value for one planned frame. Never collides with the
    /// audio-end id.
    fn frame_code(context_hash: u64, frame: usize, book: usize) -> u32 {
        let folded = mix(mix(context_hash, frame as u64 + 1), book as u64 + 1);
        (folded % (CODEBOOK_VOCAB as u64 - 2)) as u32
    }

    fn frame_codes(context_hash: u64, frame: usize) -> Vec<u32> {
        (0..CODEBOOKS)
            .map(|book| Self::frame_code(context_hash, frame, book))
            .collect()
    }

    /// Logits for the next planned position, advancing the cursor.
    fn next_logits(&self, workspace: &mut KvWorkspace) -> Result<StepLogits> {
        if workspace.scratch.len() < PLAN_OFFSET {
            return Err(Error::ModelError(
                "decode step before prefill".to_string(),
            ));
        }
        let cursor = workspace.scratch[0] as usize;
        let context_hash =
            (workspace.scratch[1] as u64) | ((workspace.scratch[2] as u64) << 32);

        let entry = workspace
            .scratch
            .get(PLAN_OFFSET + cursor)
            .copied()
            .unwrap_or(PLAN_EOS);
        workspace.scratch[0] = (cursor + 1) as u32;

        match entry {
            PLAN_BEGIN => Ok(StepLogits::Text(self.text_logits(AUDIO_BEGIN_ID)?)),
            PLAN_EOS => Ok(StepLogits::Text(self.text_logits(EOS_ID)?)),
            PLAN_END => {
                let mut codes = vec![0u32; CODEBOOKS];
                codes[0] = AUDIO_END_ID;
                Ok(StepLogits::Audio(self.audio_rows(&codes)?))
            }
            frame => {
                let codes = Self::frame_codes(context_hash, frame as usize);
                Ok(StepLogits::Audio(self.audio_rows(&codes)?))
            }
        }
    }

    fn step_impl(&self, event: &TokenEvent, workspace: &mut KvWorkspace) -> Result<StepLogits> {
        workspace.advance(1)?;
        let logits = self.next_logits(workspace)?;

        // The emitted alphabet must track the stream state regardless of
        // where the plan cursor sits.
        let expects_audio = matches!(event, TokenEvent::AudioBegin | TokenEvent::AudioFrame(_));
        match (&logits, expects_audio) {
            (StepLogits::Audio(_), true) | (StepLogits::Text(_), false) => Ok(logits),
            (_, true) => {
                let mut codes = vec![0u32; CODEBOOKS];
                codes[0] = AUDIO_END_ID;
                Ok(StepLogits::Audio(self.audio_rows(&codes)?))
            }
            (_, false) => Ok(StepLogits::Text(self.text_logits(EOS_ID)?)),
        }
    }
}

/// Reference generation model.
pub struct ReferenceModel {
    core: Arc<ReferenceCore>,
}

impl Default for ReferenceModel {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl ReferenceModel {
    pub fn new(device: Device) -> Self {
        Self {
            core: Arc::new(ReferenceCore { device }),
        }
    }
}

impl GenerationModel for ReferenceModel {
    fn markers(&self) -> TokenMarkers {
        TokenMarkers {
            audio_begin: AUDIO_BEGIN_ID,
            audio_end: AUDIO_END_ID,
            eos: EOS_ID,
        }
    }

    fn num_codebooks(&self) -> usize {
        CODEBOOKS
    }

    fn workspace_spec(&self) -> WorkspaceSpec {
        WorkspaceSpec {
            num_layers: 2,
            kv_dim: 8,
        }
    }

    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn encode_context(&self, turns: &[Turn]) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for turn in turns {
            ids.push(match turn.role {
                Role::System => SYSTEM_ID,
                Role::User => USER_ID,
                Role::Assistant => ASSISTANT_ID,
            });
            match &turn.payload {
                TurnPayload::Text(text) => ids.extend(self.encode_text(text)?),
                TurnPayload::Audio(audio) => {
                    for frame in &audio.frames {
                        let folded = hash_ids(frame) % 256;
                        ids.push(AUDIO_TURN_BASE + folded as u32);
                    }
                }
            }
        }
        Ok(ids)
    }

    fn prefill(&self, tokens: &[u32], workspace: &mut KvWorkspace) -> Result<Tensor> {
        workspace.advance(tokens.len())?;

        // Planned audio length follows the final user turn's text ids.
        let last_user = tokens.iter().rposition(|&id| id == USER_ID);
        let tail = match last_user {
            Some(pos) => &tokens[pos + 1..],
            None => tokens,
        };
        let n_text = tail.iter().filter(|&&id| id < 256).count();
        let frames = n_text.clamp(MIN_FRAMES, MAX_FRAMES);

        let context_hash = hash_ids(tokens);

        workspace.scratch.clear();
        workspace.scratch.push(1); // cursor: prefill serves plan[0]
        workspace.scratch.push(context_hash as u32);
        workspace.scratch.push((context_hash >> 32) as u32);
        workspace.scratch.push(PLAN_BEGIN);
        for frame in 0..frames {
            workspace.scratch.push(frame as u32);
        }
        workspace.scratch.push(PLAN_END);
        workspace.scratch.push(PLAN_EOS);

        self.core.text_logits(AUDIO_BEGIN_ID)
    }

    fn step(&self, event: &TokenEvent, workspace: &mut KvWorkspace) -> Result<StepLogits> {
        self.core.step_impl(event, workspace)
    }

    fn capture_graph(
        &self,
        bucket: usize,
        _workspace: &mut KvWorkspace,
    ) -> Result<Option<Box<dyn CapturedGraph>>> {
        debug!(bucket, "captured reference graph");
        Ok(Some(Box::new(ReferenceGraph {
            core: self.core.clone(),
        })))
    }
}

/// Captured handle that replays the uncaptured path; lets every fast-path
/// branch run under tests.
struct ReferenceGraph {
    core: Arc<ReferenceCore>,
}

impl CapturedGraph for ReferenceGraph {
    fn step(&self, event: &TokenEvent, workspace: &mut KvWorkspace) -> Result<StepLogits> {
        self.core.step_impl(event, workspace)
    }
}

/// Reference codec: one token frame per 80 ms of audio at 24 kHz.
pub struct ReferenceCodec {
    sample_rate: u32,
}

pub const SAMPLES_PER_FRAME: usize = 1920;

impl Default for ReferenceCodec {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
        }
    }
}

impl SpeechCodec for ReferenceCodec {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn num_codebooks(&self) -> usize {
        CODEBOOKS
    }

    fn tokenize(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<Vec<u32>>> {
        if samples.is_empty() || sample_rate == 0 {
            return Ok(Vec::new());
        }
        let native_len = samples.len() as u64 * self.sample_rate as u64 / sample_rate as u64;
        let frames = native_len.div_ceil(SAMPLES_PER_FRAME as u64).max(1) as usize;

        let seed = mix(hash_ids(&[frames as u32]), samples.len() as u64);
        Ok((0..frames)
            .map(|frame| {
                (0..CODEBOOKS)
                    .map(|book| ReferenceCore::frame_code(seed, frame, book))
                    .collect()
            })
            .collect())
    }

    fn detokenize(&self, frames: &[Vec<u32>]) -> Result<Vec<f32>> {
        let mut samples = Vec::with_capacity(frames.len() * SAMPLES_PER_FRAME);
        for frame in frames {
            let code = frame.first().copied().unwrap_or(0);
            let freq = 80.0 + (code % 64) as f32 * 6.0;
            let step = 2.0 * std::f32::consts::PI * freq / self.sample_rate as f32;
            for i in 0..SAMPLES_PER_FRAME {
                samples.push(0.3 * (step * i as f32).sin());
            }
        }
        Ok(samples)
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReferenceManifest {
    #[serde(default)]
    sample_rate: Option<u32>,
}

/// Loads the reference backend. Reads an optional `config.json` from the
/// codec directory for the sample rate; missing manifests fall back to
/// defaults so the backend also works against an empty volume.
pub struct ReferenceLoader;

fn read_manifest(dir: &Path) -> ReferenceManifest {
    let path = dir.join("config.json");
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => ReferenceManifest::default(),
    }
}

impl ModelLoader for ReferenceLoader {
    fn load_model(&self, cfg: &EngineConfig, device: &Device) -> Result<Box<dyn GenerationModel>> {
        info!(
            "Loading reference generation model (weights dir {})",
            cfg.model_dir.display()
        );
        Ok(Box::new(ReferenceModel::new(device.clone())))
    }

    fn load_codec(&self, cfg: &EngineConfig, _device: &Device) -> Result<Arc<dyn SpeechCodec>> {
        let manifest = read_manifest(&cfg.codec_dir);
        let sample_rate = manifest.sample_rate.unwrap_or(24_000);
        info!(
            "Loading reference codec (dir {}, {} Hz)",
            cfg.codec_dir.display(),
            sample_rate
        );
        Ok(Arc::new(ReferenceCodec { sample_rate }))
    }
}
