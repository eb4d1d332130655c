//! Job orchestration: the single per-job entry point that composes parsing,
//! validation, prompt assembly, generation, audio assembly, and delivery.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use crate::audio::{encode_wav, AudioAssembler, AudioBuffer};
use crate::config::EngineConfig;
use crate::engine::generation::{run_chunk, ChunkOutcome, RunOptions};
use crate::engine::lifecycle::ModelLifecycle;
use crate::engine::sampling::SamplingContext;
use crate::error::{Error, Result};
use crate::model::SpeechCodec;
use crate::prompt::{self, Turn};
use crate::sink::{ArtifactSink, Delivery};
use crate::types::{
    AudioPayload, FastPathKind, JobMetadata, JobRequest, JobResponse, RasPolicy, SamplingPolicy,
};
use crate::validate;
use crate::voices::VoiceRegistry;

/// Progress carried across the pipeline so failures can report how far the
/// job got.
#[derive(Default)]
struct JobTrace {
    warnings: Vec<String>,
    voice: Option<String>,
    seed: Option<u64>,
    chunks_total: usize,
    chunks_completed: usize,
    fast_path: Option<FastPathKind>,
    truncated: bool,
}

pub struct JobRunner {
    cfg: EngineConfig,
    lifecycle: Arc<ModelLifecycle>,
    voices: Arc<VoiceRegistry>,
    sink: ArtifactSink,
}

impl JobRunner {
    pub fn new(cfg: EngineConfig, lifecycle: Arc<ModelLifecycle>, voices: Arc<VoiceRegistry>) -> Self {
        let sink = ArtifactSink::new(&cfg);
        Self::with_sink(cfg, lifecycle, voices, sink)
    }

    pub fn with_sink(
        cfg: EngineConfig,
        lifecycle: Arc<ModelLifecycle>,
        voices: Arc<VoiceRegistry>,
        sink: ArtifactSink,
    ) -> Self {
        Self {
            cfg,
            lifecycle,
            voices,
            sink,
        }
    }

    /// Process one job payload. Never panics the caller's envelope: every
    /// error is classified and folded into a structured failure response.
    pub async fn run(&self, input: &Value) -> JobResponse {
        let started = Instant::now();
        let mut trace = JobTrace::default();

        match self.execute(input, started, &mut trace).await {
            Ok(response) => response,
            Err(error) => {
                warn!(kind = error.kind(), "job failed: {error}");
                JobResponse::failure(&error, failure_metadata(&trace, started))
            }
        }
    }

    async fn execute(
        &self,
        input: &Value,
        started: Instant,
        trace: &mut JobTrace,
    ) -> Result<JobResponse> {
        let (request, parse_warnings) = JobRequest::from_value(input)?;
        trace.warnings.clone_from(&parse_warnings);

        let job = validate::validate(&request, &self.cfg, &self.voices, parse_warnings).await?;
        trace.warnings.clone_from(&job.warnings);

        let voice = match &job.voice {
            Some(id) => Some(self.voices.resolve(id).await?),
            None => None,
        };
        trace.voice = voice.as_ref().map(|v| v.id.clone());

        let codec = self.lifecycle.codec()?;
        let context = prompt::assemble(
            &job.transcript,
            job.scene_prompt.as_deref(),
            voice.as_deref(),
            &job.chunking,
            codec.as_ref(),
        )?;
        if context.num_chunks() == 0 {
            return Err(Error::InvalidInput(
                "transcript produced no speakable chunks".to_string(),
            ));
        }
        trace.chunks_total = context.num_chunks();

        let seed = job
            .sampling
            .seed
            .unwrap_or_else(SamplingContext::entropy_seed);
        trace.seed = Some(seed);
        let policy = SamplingPolicy {
            seed: Some(seed),
            ..job.sampling.clone()
        };

        let deadline = started + self.cfg.job_timeout;
        let opts = RunOptions {
            allow_captured: true,
            deadline: Some(deadline),
            timeout_secs: self.cfg.job_timeout.as_secs(),
        };

        let mut assembler = AudioAssembler::new(
            codec.sample_rate(),
            self.cfg.resample_quality,
            self.cfg.empty_chunk,
        );

        info!(
            chunks = context.num_chunks(),
            voice = trace.voice.as_deref().unwrap_or("none"),
            seed,
            "starting generation"
        );

        let generation_started = Instant::now();
        let mut ctx = SamplingContext::new(seed);

        for chunk_index in 0..context.num_chunks() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    limit_secs: self.cfg.job_timeout.as_secs(),
                });
            }

            let turns = context.turns_for_chunk(chunk_index);
            let (returned_ctx, mut outcome) = self
                .generate_chunk(turns.clone(), &policy, job.ras, ctx, codec.clone(), opts)
                .await
                .map_err(|err| err.with_chunk(chunk_index))?;
            ctx = returned_ctx;

            if outcome.frames == 0 {
                // One retry on the non-captured path, same inputs.
                info!(chunk = chunk_index, "empty chunk, retrying without captured graph");
                let retry_opts = RunOptions {
                    allow_captured: false,
                    ..opts
                };
                let (returned_ctx, retried) = self
                    .generate_chunk(turns, &policy, job.ras, ctx, codec.clone(), retry_opts)
                    .await
                    .map_err(|err| err.with_chunk(chunk_index))?;
                ctx = returned_ctx;
                outcome = retried;
            }

            trace.fast_path = Some(match trace.fast_path {
                Some(seen) => seen.max(outcome.fast_path),
                None => outcome.fast_path,
            });
            trace.truncated |= outcome.truncated;

            if outcome.frames == 0 {
                assembler.push_empty_chunk(chunk_index)?;
            } else {
                assembler.push_chunk(AudioBuffer::new(outcome.samples, outcome.sample_rate))?;
            }
            trace.chunks_completed += 1;
        }

        let generation_latency = generation_started.elapsed();
        let audio = assembler.finish();
        if audio.is_empty() {
            return Err(Error::GenerationEmpty { chunk: 0 });
        }

        let wav = encode_wav(&audio.samples, audio.sample_rate)?;
        let delivery = self.sink.deliver(wav, job.sink.as_ref()).await?;

        let (mode, bytes_base64, url) = match delivery {
            Delivery::Inline { bytes_base64 } => ("inline", Some(bytes_base64), None),
            Delivery::External { url } => ("external", None, Some(url)),
        };

        info!(
            duration_secs = audio.duration_secs(),
            latency_secs = generation_latency.as_secs_f64(),
            chunks = trace.chunks_total,
            mode,
            "job complete"
        );

        Ok(JobResponse {
            ok: true,
            audio: Some(AudioPayload {
                mode: mode.to_string(),
                bytes_base64,
                url,
                container: "wave-pcm-16".to_string(),
                sample_rate: audio.sample_rate,
            }),
            text: Some(job.transcript.clone()),
            metadata: Some(JobMetadata {
                duration_seconds: audio.duration_secs(),
                generation_latency_seconds: generation_latency.as_secs_f64(),
                chunks: trace.chunks_total,
                chunks_completed: None,
                fast_path: trace
                    .fast_path
                    .map(|path| path.as_str().to_string())
                    .unwrap_or_else(|| FastPathKind::Dynamic.as_str().to_string()),
                voice: trace.voice.clone(),
                seed,
                truncated: trace.truncated,
                warnings: trace.warnings.clone(),
            }),
            error: None,
        })
    }

    /// Run one chunk under an exclusive device acquisition. The guard drops
    /// inside the blocking task, releasing the device on every exit path.
    async fn generate_chunk(
        &self,
        turns: Vec<Turn>,
        policy: &SamplingPolicy,
        ras: RasPolicy,
        ctx: SamplingContext,
        codec: Arc<dyn SpeechCodec>,
        opts: RunOptions,
    ) -> Result<(SamplingContext, ChunkOutcome)> {
        let mut guard = self.lifecycle.acquire().await?;
        let policy = policy.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut ctx = ctx;
            let result = (|| {
                let session = guard.session()?;
                run_chunk(session, codec.as_ref(), &turns, &policy, ras, &mut ctx, &opts)
            })();
            (ctx, result)
        });

        let (ctx, result) = handle
            .await
            .map_err(|err| Error::Internal(format!("generation task failed: {err}")))?;
        Ok((ctx, result?))
    }
}

impl Error {
    /// Attach the chunk index to errors that escape the generation loop.
    fn with_chunk(self, chunk: usize) -> Self {
        match self {
            Error::ModelError(message) => {
                Error::ModelError(format!("chunk {chunk}: {message}"))
            }
            other => other,
        }
    }
}

fn failure_metadata(trace: &JobTrace, started: Instant) -> Option<JobMetadata> {
    if trace.chunks_total == 0 {
        return None;
    }
    Some(JobMetadata {
        duration_seconds: 0.0,
        generation_latency_seconds: started.elapsed().as_secs_f64(),
        chunks: trace.chunks_total,
        chunks_completed: Some(trace.chunks_completed),
        fast_path: trace
            .fast_path
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| "none".to_string()),
        voice: trace.voice.clone(),
        seed: trace.seed.unwrap_or_default(),
        truncated: trace.truncated,
        warnings: trace.warnings.clone(),
    })
}
