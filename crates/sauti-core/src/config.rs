//! Worker configuration resolved from the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use candle_core::DType;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audio::ResampleQuality;
use crate::error::{Error, Result};

pub const DEFAULT_LENGTH_BUCKETS: &[usize] = &[128, 256, 512, 1024, 2048, 4096];

/// Numeric format for model parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "f16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f32" | "float32" => Ok(Precision::F32),
            other => Err(format!("unknown precision '{other}'")),
        }
    }
}

/// What to do when a chunk produces no audio even after the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyChunkPolicy {
    /// Fail the whole job (default).
    Escalate,
    /// Splice configured silence in place of the chunk.
    Splice { silence_ms: u64 },
}

/// Object store credentials and endpoint, environment-only. Never accepted
/// from the request body.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Defaults applied to sampling parameters the request omits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingDefaults {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub max_new_tokens: usize,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 0.95,
            max_new_tokens: 2048,
        }
    }
}

/// Immutable worker configuration, resolved once at startup and passed
/// through the pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory the generation model loads from.
    pub model_dir: PathBuf,
    /// Directory the audio codec loads from.
    pub codec_dir: PathBuf,
    /// Root directory scanned for reference voices.
    pub voice_dir: PathBuf,
    /// Compute device identifier: `auto`, `cpu`, `cuda:N`, or `metal`.
    pub device: String,
    pub precision: Precision,
    /// Ordered context-length ceilings for the fast-path cache.
    pub length_buckets: Vec<usize>,
    /// Capture accelerator graphs per bucket during warm-up.
    pub capture_graphs: bool,
    pub max_transcript_chars: usize,
    pub sampling: SamplingDefaults,
    /// Hard upper bound on `max_new_tokens` requests may ask for.
    pub max_new_tokens_ceiling: usize,
    /// Largest inline (base64) audio payload in container bytes.
    pub inline_cap_bytes: usize,
    pub job_timeout: Duration,
    pub empty_chunk: EmptyChunkPolicy,
    pub resample_quality: ResampleQuality,
    pub object_store: Option<ObjectStoreConfig>,
}

impl EngineConfig {
    /// Resolve configuration from the process environment.
    ///
    /// Missing required variables abort startup with [`Error::ConfigMissing`];
    /// malformed optional values fall back to their defaults with a warning.
    pub fn from_env() -> Result<Self> {
        let model_dir = PathBuf::from(require_env("SAUTI_MODEL_DIR")?);
        let codec_dir = PathBuf::from(require_env("SAUTI_CODEC_DIR")?);
        let voice_dir = PathBuf::from(require_env("SAUTI_VOICE_DIR")?);

        let length_buckets = match env_trimmed("SAUTI_LENGTH_BUCKETS") {
            Some(raw) => parse_buckets(&raw)?,
            None => DEFAULT_LENGTH_BUCKETS.to_vec(),
        };

        let empty_chunk = match env_trimmed("SAUTI_EMPTY_CHUNK").as_deref() {
            None | Some("escalate") => EmptyChunkPolicy::Escalate,
            Some("splice") => EmptyChunkPolicy::Splice {
                silence_ms: env_parse("SAUTI_SPLICE_SILENCE_MS", 0),
            },
            Some(other) => {
                warn!("Invalid SAUTI_EMPTY_CHUNK='{other}', falling back to escalate");
                EmptyChunkPolicy::Escalate
            }
        };

        Ok(Self {
            model_dir,
            codec_dir,
            voice_dir,
            device: env_trimmed("SAUTI_DEVICE").unwrap_or_else(|| "auto".to_string()),
            precision: env_parse("SAUTI_PRECISION", Precision::F16),
            length_buckets,
            capture_graphs: env_parse("SAUTI_CAPTURE_GRAPHS", false),
            max_transcript_chars: env_parse("SAUTI_MAX_TRANSCRIPT_CHARS", 10_000),
            sampling: SamplingDefaults {
                temperature: env_parse("SAUTI_DEFAULT_TEMPERATURE", 1.0),
                top_k: env_parse("SAUTI_DEFAULT_TOP_K", 50),
                top_p: env_parse("SAUTI_DEFAULT_TOP_P", 0.95),
                max_new_tokens: env_parse("SAUTI_DEFAULT_MAX_NEW_TOKENS", 2048),
            },
            max_new_tokens_ceiling: env_parse("SAUTI_MAX_NEW_TOKENS_CEILING", 4096),
            inline_cap_bytes: env_parse("SAUTI_INLINE_CAP_BYTES", 8 * 1024 * 1024),
            job_timeout: Duration::from_secs(env_parse("SAUTI_JOB_TIMEOUT_SECS", 300)),
            empty_chunk,
            resample_quality: env_parse("SAUTI_RESAMPLE_QUALITY", ResampleQuality::Normal),
            object_store: object_store_from_env()?,
        })
    }

    /// Construct a config rooted at explicit directories with defaults for
    /// everything else. Primarily for tests and embedding.
    pub fn with_dirs(
        model_dir: impl Into<PathBuf>,
        codec_dir: impl Into<PathBuf>,
        voice_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_dir: model_dir.into(),
            codec_dir: codec_dir.into(),
            voice_dir: voice_dir.into(),
            device: "cpu".to_string(),
            precision: Precision::F32,
            length_buckets: DEFAULT_LENGTH_BUCKETS.to_vec(),
            capture_graphs: false,
            max_transcript_chars: 10_000,
            sampling: SamplingDefaults::default(),
            max_new_tokens_ceiling: 4096,
            inline_cap_bytes: 8 * 1024 * 1024,
            job_timeout: Duration::from_secs(300),
            empty_chunk: EmptyChunkPolicy::Escalate,
            resample_quality: ResampleQuality::Normal,
            object_store: None,
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    env_trimmed(name).ok_or_else(|| Error::ConfigMissing(name.to_string()))
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env_trimmed(name) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {name}='{raw}', falling back to default");
                default
            }
        },
    }
}

/// Parse a comma-separated bucket list, e.g. `"128,256,512"`. The result is
/// sorted ascending and deduplicated; an empty or unparsable list is a
/// startup error since the fast-path cache cannot operate without buckets.
pub fn parse_buckets(raw: &str) -> Result<Vec<usize>> {
    let mut buckets = Vec::new();
    for piece in raw.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let value: usize = piece
            .parse()
            .map_err(|_| Error::ConfigMissing(format!("SAUTI_LENGTH_BUCKETS: bad entry '{piece}'")))?;
        if value == 0 {
            return Err(Error::ConfigMissing(
                "SAUTI_LENGTH_BUCKETS: buckets must be positive".to_string(),
            ));
        }
        buckets.push(value);
    }
    buckets.sort_unstable();
    buckets.dedup();
    if buckets.is_empty() {
        return Err(Error::ConfigMissing(
            "SAUTI_LENGTH_BUCKETS: no buckets configured".to_string(),
        ));
    }
    Ok(buckets)
}

fn object_store_from_env() -> Result<Option<ObjectStoreConfig>> {
    let endpoint = env_trimmed("SAUTI_STORE_ENDPOINT");
    let access_key = env_trimmed("SAUTI_STORE_ACCESS_KEY");
    let secret_key = env_trimmed("SAUTI_STORE_SECRET_KEY");

    match (endpoint, access_key, secret_key) {
        (None, None, None) => Ok(None),
        (Some(endpoint), Some(access_key), Some(secret_key)) => Ok(Some(ObjectStoreConfig {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key,
            secret_key,
            region: env_trimmed("SAUTI_STORE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        })),
        _ => Err(Error::ConfigMissing(
            "object store requires SAUTI_STORE_ENDPOINT, SAUTI_STORE_ACCESS_KEY and \
             SAUTI_STORE_SECRET_KEY together"
                .to_string(),
        )),
    }
}
