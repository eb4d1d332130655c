//! Per-chunk autoregressive generation: the two-alphabet sampling loop.

use std::time::Instant;

use tracing::{debug, trace};

use crate::engine::fastpath::{FastPathEntry, Selection};
use crate::error::{Error, Result};
use crate::model::{CapturedGraph, KvWorkspace, SpeechCodec, StepLogits, TokenEvent};
use crate::engine::lifecycle::GpuSession;
use crate::engine::sampling::{sample_token, sample_with_ras, RasWindow, SamplingContext};
use crate::prompt::Turn;
use crate::types::{FastPathKind, RasPolicy, SamplingPolicy};

/// Per-chunk generation state machine. `DecodingAudio` returns to
/// `DecodingText` between audio blocks and between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenStage {
    Encoding,
    DecodingText,
    DecodingAudio,
    Detokenizing,
    Done,
}

impl GenStage {
    fn as_str(self) -> &'static str {
        match self {
            GenStage::Encoding => "encoding",
            GenStage::DecodingText => "decoding-text",
            GenStage::DecodingAudio => "decoding-audio",
            GenStage::Detokenizing => "detokenizing",
            GenStage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Allow the captured-graph path. The empty-chunk retry runs with this
    /// cleared.
    pub allow_captured: bool,
    /// Job deadline; generation aborts at the next step boundary past it.
    pub deadline: Option<Instant>,
    /// Ceiling in seconds, reported in the Timeout error.
    pub timeout_secs: u64,
}

#[derive(Debug)]
pub struct ChunkOutcome {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub frames: usize,
    pub fast_path: FastPathKind,
    pub truncated: bool,
}

/// Run one chunk to audio. The caller holds the device guard; every exit
/// path leaves the session reusable (workspaces are reset on entry).
pub fn run_chunk(
    session: &mut GpuSession,
    codec: &dyn SpeechCodec,
    turns: &[Turn],
    sampling: &SamplingPolicy,
    ras_policy: RasPolicy,
    ctx: &mut SamplingContext,
    opts: &RunOptions,
) -> Result<ChunkOutcome> {
    let GpuSession {
        model,
        fastpath,
        device,
        dtype,
    } = session;
    let model = model.as_ref();

    let mut stage = GenStage::Encoding;
    trace!(stage = stage.as_str(), "chunk start");

    let context_ids = model.encode_context(turns)?;
    let context_len = context_ids.len();

    // Dynamic-path workspace lives only for this chunk; bucketed workspaces
    // are cache-owned and reused.
    let mut dynamic_ws: Option<KvWorkspace> = None;
    let selection = fastpath.select(context_len, opts.allow_captured);
    let fast_path = selection.kind();
    let (workspace, graph): (&mut KvWorkspace, Option<&dyn CapturedGraph>) = match selection {
        Selection::Bucketed { entry, use_graph } => {
            let FastPathEntry {
                workspace, graph, ..
            } = entry;
            (workspace, if use_graph { graph.as_deref() } else { None })
        }
        Selection::Dynamic => {
            let ws = KvWorkspace::allocate(model.workspace_spec(), None, device, *dtype)?;
            (dynamic_ws.insert(ws), None)
        }
    };

    debug!(
        context_len,
        fast_path = fast_path.as_str(),
        "running generation chunk"
    );

    workspace.reset();
    let markers = model.markers();
    let mut ras = RasWindow::new(ras_policy);

    let mut logits = StepLogits::Text(model.prefill(&context_ids, workspace)?);
    stage = GenStage::DecodingText;

    let mut frames: Vec<Vec<u32>> = Vec::new();
    let mut steps = 0usize;
    let mut truncated = false;

    loop {
        if steps >= sampling.max_new_tokens {
            truncated = true;
            break;
        }
        if let Some(deadline) = opts.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    limit_secs: opts.timeout_secs,
                });
            }
        }

        // Sample the next event in whichever alphabet the model is emitting.
        let event = match &logits {
            StepLogits::Text(text_logits) => {
                let token = sample_with_ras(text_logits, sampling, &ras, ctx)?;
                ras.push(token);
                steps += 1;
                if token == markers.eos {
                    trace!(steps, "end-of-stream");
                    break;
                }
                if token == markers.audio_begin {
                    stage = GenStage::DecodingAudio;
                    trace!(stage = stage.as_str(), steps, "audio block begins");
                    TokenEvent::AudioBegin
                } else {
                    TokenEvent::Text(token)
                }
            }
            StepLogits::Audio(rows) => {
                let head = sample_with_ras(&rows[0], sampling, &ras, ctx)?;
                ras.push(head);
                steps += 1;
                if head == markers.audio_end {
                    stage = GenStage::DecodingText;
                    trace!(stage = stage.as_str(), steps, "audio block ends");
                    TokenEvent::AudioEnd
                } else {
                    let mut frame = Vec::with_capacity(rows.len());
                    frame.push(head);
                    for row in &rows[1..] {
                        frame.push(sample_token(row, sampling, ctx)?);
                    }
                    frames.push(frame.clone());
                    TokenEvent::AudioFrame(frame)
                }
            }
        };

        // A full fixed workspace ends the chunk as a truncation, mirroring
        // the max-new-tokens stop.
        if !workspace.has_room(1) {
            truncated = true;
            break;
        }

        let next = match graph {
            Some(graph) => graph.step(&event, workspace),
            None => model.step(&event, workspace),
        };
        logits = next.map_err(|e| {
            Error::ModelError(format!("decode step failed in {}: {e}", stage.as_str()))
        })?;

        // The returned alphabet must track the stream state.
        let expects_audio = matches!(event, TokenEvent::AudioBegin | TokenEvent::AudioFrame(_));
        match (&logits, expects_audio) {
            (StepLogits::Audio(_), true) | (StepLogits::Text(_), false) => {}
            _ => {
                return Err(Error::ModelError(format!(
                    "model emitted the wrong alphabet in {}",
                    stage.as_str()
                )))
            }
        }
    }

    stage = GenStage::Detokenizing;
    let samples = if frames.is_empty() {
        Vec::new()
    } else {
        codec
            .detokenize(&frames)
            .map_err(|e| Error::ModelError(format!("{} failed: {e}", stage.as_str())))?
    };

    stage = GenStage::Done;
    debug!(
        stage = stage.as_str(),
        frames = frames.len(),
        steps,
        truncated,
        "chunk finished"
    );

    Ok(ChunkOutcome {
        samples,
        sample_rate: codec.sample_rate(),
        frames: frames.len(),
        fast_path,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::reference::{ReferenceCodec, ReferenceLoader};
    use crate::config::EngineConfig;
    use crate::engine::fastpath::FastPathCache;
    use crate::model::ModelLoader;
    use crate::prompt::{Role, Turn};
    use candle_core::{DType, Device};

    fn session(capture: bool) -> GpuSession {
        let cfg = EngineConfig::with_dirs("/tmp/m", "/tmp/c", "/tmp/v");
        let device = Device::Cpu;
        let model = ReferenceLoader.load_model(&cfg, &device).unwrap();
        let fastpath = FastPathCache::warm(
            model.as_ref(),
            &cfg.length_buckets,
            capture,
            &device,
            DType::F32,
        )
        .unwrap();
        GpuSession {
            model,
            fastpath,
            device,
            dtype: DType::F32,
        }
    }

    fn turns(text: &str) -> Vec<Turn> {
        vec![
            Turn::text(Role::System, "Audio is recorded in a quiet indoor environment."),
            Turn::text(Role::User, text),
        ]
    }

    fn policy(seed: u64) -> SamplingPolicy {
        SamplingPolicy {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            max_new_tokens: 512,
            seed: Some(seed),
        }
    }

    const RAS: RasPolicy = RasPolicy {
        win_len: 7,
        max_repeats: 2,
    };

    fn opts() -> RunOptions {
        RunOptions {
            allow_captured: true,
            deadline: None,
            timeout_secs: 300,
        }
    }

    #[test]
    fn chunk_produces_audio() {
        let mut session = session(false);
        let codec = ReferenceCodec::default();
        let mut ctx = SamplingContext::new(1);

        let outcome = run_chunk(
            &mut session,
            &codec,
            &turns("Hello world."),
            &policy(1),
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();

        assert!(outcome.frames > 0);
        assert!(!outcome.samples.is_empty());
        assert_eq!(outcome.sample_rate, 24_000);
        assert!(!outcome.truncated);
        assert_eq!(outcome.fast_path, FastPathKind::Workspace);
    }

    #[test]
    fn deterministic_for_same_seed() {
        let codec = ReferenceCodec::default();

        let mut run = |seed: u64| {
            let mut session = session(false);
            let mut ctx = SamplingContext::new(seed);
            run_chunk(
                &mut session,
                &codec,
                &turns("Deterministic output please."),
                &policy(seed),
                RAS,
                &mut ctx,
                &opts(),
            )
            .unwrap()
            .samples
        };

        let first = run(42);
        let second = run(42);
        assert_eq!(first, second);
    }

    #[test]
    fn captured_graph_path_is_used_and_equivalent() {
        let codec = ReferenceCodec::default();

        let mut captured = session(true);
        let mut ctx = SamplingContext::new(9);
        let with_graph = run_chunk(
            &mut captured,
            &codec,
            &turns("Graph replay."),
            &policy(9),
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();
        assert_eq!(with_graph.fast_path, FastPathKind::Captured);

        let mut plain = session(false);
        let mut ctx = SamplingContext::new(9);
        let without = run_chunk(
            &mut plain,
            &codec,
            &turns("Graph replay."),
            &policy(9),
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();
        assert_eq!(with_graph.samples, without.samples);
    }

    #[test]
    fn max_new_tokens_truncates() {
        let mut session = session(false);
        let codec = ReferenceCodec::default();
        let mut ctx = SamplingContext::new(5);

        let mut tight = policy(5);
        tight.max_new_tokens = 4;
        let outcome = run_chunk(
            &mut session,
            &codec,
            &turns("A transcript that wants more than four steps of audio."),
            &tight,
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();
        assert!(outcome.truncated);
        assert!(outcome.frames >= 1);
    }

    #[test]
    fn expired_deadline_times_out() {
        let mut session = session(false);
        let codec = ReferenceCodec::default();
        let mut ctx = SamplingContext::new(5);

        let expired = RunOptions {
            allow_captured: true,
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
            timeout_secs: 30,
        };
        let err = run_chunk(
            &mut session,
            &codec,
            &turns("Too slow."),
            &policy(5),
            RAS,
            &mut ctx,
            &expired,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "Timeout");
    }

    #[test]
    fn workspace_is_reusable_across_chunks() {
        let mut session = session(false);
        let codec = ReferenceCodec::default();

        let mut ctx = SamplingContext::new(3);
        let first = run_chunk(
            &mut session,
            &codec,
            &turns("First chunk."),
            &policy(3),
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();

        let mut ctx = SamplingContext::new(3);
        let second = run_chunk(
            &mut session,
            &codec,
            &turns("First chunk."),
            &policy(3),
            RAS,
            &mut ctx,
            &opts(),
        )
        .unwrap();
        // Same inputs through the same reused workspace: identical output.
        assert_eq!(first.samples, second.samples);
    }
}
