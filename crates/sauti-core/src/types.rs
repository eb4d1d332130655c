//! Job request/response wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The closed set of recognized request fields. Anything else is collected
/// into `metadata.warnings`, never silently accepted.
pub const KNOWN_FIELDS: &[&str] = &[
    "transcript",
    "ref_audio",
    "scene_prompt",
    "temperature",
    "top_k",
    "top_p",
    "max_new_tokens",
    "seed",
    "chunk_method",
    "chunk_max_word_num",
    "chunk_max_num_turns",
    "ras_win_len",
    "ras_win_max_num_repeat",
    "sink",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkMethod {
    #[default]
    None,
    ByWord,
    BySpeaker,
}

/// Raw job request as received from the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub transcript: String,
    #[serde(default)]
    pub ref_audio: Option<String>,
    #[serde(default)]
    pub scene_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_new_tokens: Option<i64>,
    /// Kept as a raw JSON number so the validator can reject seeds that are
    /// not representable as u64 instead of failing the whole parse.
    #[serde(default)]
    pub seed: Option<serde_json::Number>,
    #[serde(default)]
    pub chunk_method: ChunkMethod,
    #[serde(default = "default_chunk_max_word_num")]
    pub chunk_max_word_num: usize,
    #[serde(default = "default_chunk_max_num_turns")]
    pub chunk_max_num_turns: usize,
    #[serde(default = "default_ras_win_len")]
    pub ras_win_len: usize,
    #[serde(default = "default_ras_win_max_num_repeat")]
    pub ras_win_max_num_repeat: usize,
    #[serde(default)]
    pub sink: Option<SinkDirective>,
}

fn default_chunk_max_word_num() -> usize {
    200
}
fn default_chunk_max_num_turns() -> usize {
    1
}
fn default_ras_win_len() -> usize {
    7
}
fn default_ras_win_max_num_repeat() -> usize {
    2
}

/// Requested external delivery target. Both fields must be present for the
/// directive to be usable; the validator rejects partial directives.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkDirective {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl JobRequest {
    /// Parse a job payload, collecting unrecognized top-level fields as
    /// warnings. Structural failures map to [`Error::InvalidInput`].
    pub fn from_value(input: &Value) -> Result<(Self, Vec<String>)> {
        let object = input
            .as_object()
            .ok_or_else(|| Error::InvalidInput("job input must be a JSON object".to_string()))?;

        let warnings: Vec<String> = object
            .keys()
            .filter(|key| !KNOWN_FIELDS.contains(&key.as_str()))
            .map(|key| format!("unrecognized option '{key}' ignored"))
            .collect();

        let request: JobRequest = serde_json::from_value(input.clone())
            .map_err(|err| Error::InvalidInput(err.to_string()))?;

        Ok((request, warnings))
    }
}

/// Sampling policy after defaults and validation.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub max_new_tokens: usize,
    pub seed: Option<u64>,
}

/// Anti-repetition window policy.
#[derive(Debug, Clone, Copy)]
pub struct RasPolicy {
    pub win_len: usize,
    pub max_repeats: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    pub method: ChunkMethod,
    pub max_words: usize,
    pub max_turns: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedSink {
    pub bucket: String,
    pub key: String,
}

/// A job that passed validation: normalized transcript, resolved policies.
#[derive(Debug, Clone)]
pub struct NormalizedJob {
    pub transcript: String,
    pub voice: Option<String>,
    pub scene_prompt: Option<String>,
    pub sampling: SamplingPolicy,
    pub chunking: ChunkPolicy,
    pub ras: RasPolicy,
    pub sink: Option<ResolvedSink>,
    pub warnings: Vec<String>,
}

/// Which decode path served the job (slowest across chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FastPathKind {
    Captured,
    Workspace,
    Dynamic,
}

impl FastPathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FastPathKind::Captured => "captured",
            FastPathKind::Workspace => "workspace",
            FastPathKind::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioPayload {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub container: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobMetadata {
    pub duration_seconds: f64,
    pub generation_latency_seconds: f64,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_completed: Option<usize>,
    pub fast_path: String,
    pub voice: Option<String>,
    pub seed: u64,
    pub truncated: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub details: Value,
}

/// The single response envelope the worker emits per job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl JobResponse {
    pub fn failure(error: &Error, metadata: Option<JobMetadata>) -> Self {
        let details = match error {
            Error::UnknownVoice { suggestions, .. } => serde_json::json!({
                "suggestions": suggestions,
            }),
            Error::PayloadTooLarge { size, limit } => serde_json::json!({
                "size_bytes": size,
                "limit_bytes": limit,
                "hint": "request an external sink for large outputs",
            }),
            Error::SinkUnavailable { attempts, .. } => serde_json::json!({
                "attempts": attempts,
            }),
            _ => Value::Null,
        };

        Self {
            ok: false,
            audio: None,
            text: None,
            metadata,
            error: Some(ErrorBody {
                kind: error.kind().to_string(),
                message: error.to_string(),
                details,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_request() {
        let (req, warnings) =
            JobRequest::from_value(&json!({ "transcript": "Hello world." })).unwrap();
        assert_eq!(req.transcript, "Hello world.");
        assert_eq!(req.chunk_method, ChunkMethod::None);
        assert_eq!(req.ras_win_len, 7);
        assert_eq!(req.ras_win_max_num_repeat, 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_fields_become_warnings() {
        let (_, warnings) = JobRequest::from_value(&json!({
            "transcript": "x",
            "voice_speed": 2.0,
            "wat": true,
        }))
        .unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("voice_speed")));
    }

    #[test]
    fn chunk_method_uses_kebab_case() {
        let (req, _) = JobRequest::from_value(&json!({
            "transcript": "x",
            "chunk_method": "by-word",
        }))
        .unwrap();
        assert_eq!(req.chunk_method, ChunkMethod::ByWord);

        let (req, _) = JobRequest::from_value(&json!({
            "transcript": "x",
            "chunk_method": "by-speaker",
        }))
        .unwrap();
        assert_eq!(req.chunk_method, ChunkMethod::BySpeaker);
    }

    #[test]
    fn non_object_input_is_invalid() {
        let err = JobRequest::from_value(&json!("just a string")).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[test]
    fn fast_path_ordering_tracks_slowdown() {
        assert!(FastPathKind::Captured < FastPathKind::Workspace);
        assert!(FastPathKind::Workspace < FastPathKind::Dynamic);
    }
}
