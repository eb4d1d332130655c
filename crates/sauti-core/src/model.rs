//! Seams to the generation model and audio codec.
//!
//! The transformer internals and the codec's signal processing live behind
//! these traits; the control plane only sees token alphabets, logits, and
//! opaque captured-graph handles. Backends provide implementations through
//! [`ModelLoader`].

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::prompt::Turn;

/// Special ids shared between the driver and the model.
///
/// `audio_begin` and `eos` live in the text alphabet; `audio_end` lives in
/// codebook 0's alphabet and terminates an audio block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMarkers {
    pub audio_begin: u32,
    pub audio_end: u32,
    pub eos: u32,
}

/// One emitted step of the two-alphabet token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Text(u32),
    AudioBegin,
    AudioFrame(Vec<u32>),
    AudioEnd,
    Eos,
}

/// Logits for the next step, in whichever alphabet the model is emitting.
pub enum StepLogits {
    /// `[vocab]` logits over the text alphabet.
    Text(Tensor),
    /// One `[codebook_vocab]` logits row per codebook.
    Audio(Vec<Tensor>),
}

/// Shape of the per-layer key/value workspace a model needs.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceSpec {
    pub num_layers: usize,
    pub kv_dim: usize,
}

/// A pre-sized (or growable) key/value workspace.
///
/// Fixed workspaces belong to fast-path buckets and are reused across jobs;
/// the write position must be reset at the start of each job. The `scratch`
/// area is backend-owned per-job state and is cleared with the position.
pub struct KvWorkspace {
    spec: WorkspaceSpec,
    capacity: Option<usize>,
    write_pos: usize,
    pub keys: Tensor,
    pub values: Tensor,
    pub scratch: Vec<u32>,
    device: Device,
    dtype: DType,
}

/// Initial capacity for the dynamic (bucketless) path.
const DYNAMIC_INITIAL_CAPACITY: usize = 256;

impl KvWorkspace {
    /// Allocate a workspace. `capacity: None` selects the dynamic path that
    /// grows on demand and works for any length.
    pub fn allocate(
        spec: WorkspaceSpec,
        capacity: Option<usize>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let rows = capacity.unwrap_or(DYNAMIC_INITIAL_CAPACITY);
        let keys = Tensor::zeros((spec.num_layers, rows, spec.kv_dim), dtype, device)?;
        let values = Tensor::zeros((spec.num_layers, rows, spec.kv_dim), dtype, device)?;
        Ok(Self {
            spec,
            capacity,
            write_pos: 0,
            keys,
            values,
            scratch: Vec::new(),
            device: device.clone(),
            dtype,
        })
    }

    pub fn spec(&self) -> WorkspaceSpec {
        self.spec
    }

    pub fn is_fixed(&self) -> bool {
        self.capacity.is_some()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Zero the write position and clear backend scratch. Required at the
    /// start of every job that reuses this workspace.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.scratch.clear();
    }

    /// Whether `n` more positions fit without growing.
    pub fn has_room(&self, n: usize) -> bool {
        match self.capacity {
            Some(cap) => self.write_pos + n <= cap,
            None => true,
        }
    }

    /// Advance the write position by `n`, growing the backing tensors when
    /// dynamic. Fixed workspaces return [`Error::ModelError`] on overflow;
    /// the driver avoids this by checking [`Self::has_room`] first.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        match self.capacity {
            Some(cap) => {
                if self.write_pos + n > cap {
                    return Err(Error::ModelError(format!(
                        "workspace overflow: {} + {n} > {cap}",
                        self.write_pos
                    )));
                }
            }
            None => {
                let mut rows = self.keys.dim(1)?;
                while self.write_pos + n > rows {
                    let extra =
                        Tensor::zeros((self.spec.num_layers, rows, self.spec.kv_dim), self.dtype, &self.device)?;
                    self.keys = Tensor::cat(&[&self.keys, &extra], 1)?;
                    self.values = Tensor::cat(&[&self.values, &extra], 1)?;
                    rows *= 2;
                }
            }
        }
        self.write_pos += n;
        Ok(())
    }
}

/// The generation model, consumed as an opaque collaborator.
pub trait GenerationModel: Send + Sync {
    fn markers(&self) -> TokenMarkers;

    fn num_codebooks(&self) -> usize;

    fn workspace_spec(&self) -> WorkspaceSpec;

    /// Tokenize plain text into the text alphabet.
    fn encode_text(&self, text: &str) -> Result<Vec<u32>>;

    /// Flatten conditioning turns into the model's prompt encoding. Audio
    /// turns expand from their precomputed codec frames.
    fn encode_context(&self, turns: &[Turn]) -> Result<Vec<u32>>;

    /// Run the prompt through the model, filling the workspace. Returns text
    /// logits for the first generated position.
    fn prefill(&self, tokens: &[u32], workspace: &mut KvWorkspace) -> Result<Tensor>;

    /// One decode step: feed the previously emitted event, receive logits
    /// for the next position. The output alphabet follows the stream state:
    /// audio logits after `AudioBegin`/`AudioFrame`, text logits otherwise.
    fn step(&self, event: &TokenEvent, workspace: &mut KvWorkspace) -> Result<StepLogits>;

    /// Capture an accelerator graph for one decode step against this
    /// workspace. `Ok(None)` when the backend has no capture support.
    fn capture_graph(
        &self,
        bucket: usize,
        workspace: &mut KvWorkspace,
    ) -> Result<Option<Box<dyn CapturedGraph>>>;
}

/// A pre-recorded execution plan for one decode step, replayable with lower
/// overhead than a fresh dispatch. Opaque to the control plane.
pub trait CapturedGraph: Send + Sync {
    fn step(&self, event: &TokenEvent, workspace: &mut KvWorkspace) -> Result<StepLogits>;
}

/// The audio codec: waveform to discrete token frames and back.
pub trait SpeechCodec: Send + Sync {
    /// Native waveform rate, also the job's default output rate.
    fn sample_rate(&self) -> u32;

    fn num_codebooks(&self) -> usize;

    /// `tokenize(waveform) → frames`, each frame one index per codebook.
    fn tokenize(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<Vec<u32>>>;

    /// `detokenize(frames) → waveform` at the native rate.
    fn detokenize(&self, frames: &[Vec<u32>]) -> Result<Vec<f32>>;
}

/// Constructs the model and codec from the configured weight directories.
/// The lifecycle manager drives this exactly once per worker.
pub trait ModelLoader: Send + Sync {
    fn load_model(&self, cfg: &EngineConfig, device: &Device) -> Result<Box<dyn GenerationModel>>;

    fn load_codec(&self, cfg: &EngineConfig, device: &Device) -> Result<Arc<dyn SpeechCodec>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkspaceSpec {
        WorkspaceSpec {
            num_layers: 2,
            kv_dim: 8,
        }
    }

    #[test]
    fn fixed_workspace_enforces_capacity() {
        let device = Device::Cpu;
        let mut ws = KvWorkspace::allocate(spec(), Some(16), &device, DType::F32).unwrap();
        assert!(ws.is_fixed());
        assert!(ws.has_room(16));
        ws.advance(16).unwrap();
        assert!(!ws.has_room(1));
        assert!(ws.advance(1).is_err());
    }

    #[test]
    fn dynamic_workspace_grows() {
        let device = Device::Cpu;
        let mut ws = KvWorkspace::allocate(spec(), None, &device, DType::F32).unwrap();
        assert!(!ws.is_fixed());
        ws.advance(DYNAMIC_INITIAL_CAPACITY + 100).unwrap();
        assert_eq!(ws.write_pos(), DYNAMIC_INITIAL_CAPACITY + 100);
        assert!(ws.keys.dim(1).unwrap() >= DYNAMIC_INITIAL_CAPACITY + 100);
    }

    #[test]
    fn reset_clears_position_and_scratch() {
        let device = Device::Cpu;
        let mut ws = KvWorkspace::allocate(spec(), Some(32), &device, DType::F32).unwrap();
        ws.advance(10).unwrap();
        ws.scratch.extend([1, 2, 3]);
        ws.reset();
        assert_eq!(ws.write_pos(), 0);
        assert!(ws.scratch.is_empty());
        assert!(ws.has_room(32));
    }
}
