//! Structural and semantic validation of one job payload. Every rejection is
//! enumerated in a single pass, before any device work.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::text;
use crate::types::{
    ChunkPolicy, JobRequest, NormalizedJob, RasPolicy, ResolvedSink, SamplingPolicy,
};
use crate::voices::VoiceRegistry;

enum Issue {
    Input(String),
    UnknownVoice {
        requested: String,
        suggestions: Vec<String>,
    },
    Config(String),
}

/// Validate a parsed request against the worker configuration, producing the
/// normalized job the pipeline runs. Validation is idempotent: a normalized
/// job revalidates to itself.
pub async fn validate(
    request: &JobRequest,
    cfg: &EngineConfig,
    registry: &VoiceRegistry,
    warnings: Vec<String>,
) -> Result<NormalizedJob> {
    let mut issues: Vec<Issue> = Vec::new();

    let transcript_chars = request.transcript.chars().count();
    if request.transcript.trim().is_empty() {
        issues.push(Issue::Input("transcript must not be empty".to_string()));
    } else if transcript_chars > cfg.max_transcript_chars {
        issues.push(Issue::Input(format!(
            "transcript is {transcript_chars} characters, over the {} limit",
            cfg.max_transcript_chars
        )));
    }

    let temperature = request.temperature.unwrap_or(cfg.sampling.temperature);
    if !(0.0..=2.0).contains(&temperature) || !temperature.is_finite() {
        issues.push(Issue::Input(format!(
            "temperature {temperature} outside [0, 2]"
        )));
    }

    let top_p = request.top_p.unwrap_or(cfg.sampling.top_p);
    if !(top_p > 0.0 && top_p <= 1.0) {
        issues.push(Issue::Input(format!("top_p {top_p} outside (0, 1]")));
    }

    let top_k = match request.top_k {
        None => cfg.sampling.top_k,
        Some(k) if (1..=1000).contains(&k) => k as usize,
        Some(k) => {
            issues.push(Issue::Input(format!("top_k {k} outside [1, 1000]")));
            cfg.sampling.top_k
        }
    };

    let max_new_tokens = match request.max_new_tokens {
        None => cfg.sampling.max_new_tokens,
        Some(n) if n >= 1 && (n as usize) <= cfg.max_new_tokens_ceiling => n as usize,
        Some(n) => {
            issues.push(Issue::Input(format!(
                "max_new_tokens {n} outside [1, {}]",
                cfg.max_new_tokens_ceiling
            )));
            cfg.sampling.max_new_tokens
        }
    };

    let seed = match &request.seed {
        None => None,
        Some(number) => match number.as_u64() {
            Some(value) => Some(value),
            None => {
                issues.push(Issue::Input(format!(
                    "seed {number} is not representable as an unsigned 64-bit integer"
                )));
                None
            }
        },
    };

    if let Some(voice) = &request.ref_audio {
        match registry.contains(voice).await {
            Ok(true) => {}
            Ok(false) => {
                let suggestions = registry.suggestions(voice).await.unwrap_or_default();
                issues.push(Issue::UnknownVoice {
                    requested: voice.clone(),
                    suggestions,
                });
            }
            Err(err) => issues.push(Issue::Config(err.to_string())),
        }
    }

    let sink = match &request.sink {
        None => None,
        Some(directive) => match (&directive.bucket, &directive.key) {
            (Some(bucket), Some(key)) if !bucket.is_empty() && !key.is_empty() => {
                if cfg.object_store.is_none() {
                    issues.push(Issue::Config(
                        "sink requested but no object store credentials are configured"
                            .to_string(),
                    ));
                    None
                } else {
                    Some(ResolvedSink {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    })
                }
            }
            _ => {
                issues.push(Issue::Input(
                    "sink directive needs both bucket and key".to_string(),
                ));
                None
            }
        },
    };

    if let Some(error) = fold_issues(issues) {
        return Err(error);
    }

    Ok(NormalizedJob {
        transcript: text::normalize_transcript(&request.transcript),
        voice: request.ref_audio.clone(),
        scene_prompt: request.scene_prompt.clone(),
        sampling: SamplingPolicy {
            temperature,
            top_k,
            top_p,
            max_new_tokens,
            seed,
        },
        chunking: ChunkPolicy {
            method: request.chunk_method,
            max_words: request.chunk_max_word_num,
            max_turns: request.chunk_max_num_turns,
        },
        ras: RasPolicy {
            win_len: request.ras_win_len,
            max_repeats: request.ras_win_max_num_repeat,
        },
        sink,
        warnings,
    })
}

/// Collapse the issue list into one surfaced error. Structural problems win
/// over voice resolution, which wins over configuration gaps; the full list
/// is preserved in the message.
fn fold_issues(issues: Vec<Issue>) -> Option<Error> {
    if issues.is_empty() {
        return None;
    }

    let mut inputs: Vec<String> = Vec::new();
    let mut voice: Option<Error> = None;
    let mut configs: Vec<String> = Vec::new();

    for issue in issues {
        match issue {
            Issue::Input(message) => inputs.push(message),
            Issue::UnknownVoice {
                requested,
                suggestions,
            } => {
                voice.get_or_insert(Error::UnknownVoice {
                    requested,
                    suggestions,
                });
            }
            Issue::Config(message) => configs.push(message),
        }
    }

    if !inputs.is_empty() {
        Some(Error::InvalidInput(inputs.join("; ")))
    } else if let Some(voice) = voice {
        Some(voice)
    } else {
        Some(Error::ConfigMissing(configs.join("; ")))
    }
}
