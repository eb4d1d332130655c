//! Conditioning-context assembly: system scene, reference voice turns, and
//! transcript chunking.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::model::SpeechCodec;
use crate::text;
use crate::types::{ChunkMethod, ChunkPolicy};
use crate::voices::VoiceReference;

/// Neutral scene used when neither the request nor the voice profile
/// supplies one.
pub const DEFAULT_SCENE: &str = "Audio is recorded in a quiet indoor environment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Reference audio carried by an assistant turn: the waveform plus its codec
/// token frames, tokenized once per job and shared across chunks.
#[derive(Debug)]
pub struct AudioTurn {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub frames: Vec<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub enum TurnPayload {
    Text(String),
    Audio(Arc<AudioTurn>),
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub payload: TurnPayload,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            payload: TurnPayload::Text(text.into()),
        }
    }

    pub fn audio(role: Role, audio: Arc<AudioTurn>) -> Self {
        Self {
            role,
            payload: TurnPayload::Audio(audio),
        }
    }
}

/// The per-job conditioning context. The shared prefix (scene + reference
/// turns) is reused verbatim for every chunk; only the final user turn is
/// replaced per chunk.
#[derive(Debug)]
pub struct ConditioningContext {
    shared: Vec<Turn>,
    pub chunks: Vec<String>,
}

impl ConditioningContext {
    /// Turns for one chunk: shared prefix plus that chunk's user turn. The
    /// assistant reply is generated, so no turn is appended for it.
    pub fn turns_for_chunk(&self, chunk_index: usize) -> Vec<Turn> {
        let mut turns = self.shared.clone();
        turns.push(Turn::text(Role::User, self.chunks[chunk_index].clone()));
        turns
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// Build the conditioning context for a job.
///
/// Turn order is fixed: system scene; then, when a voice reference is in
/// use, a user turn carrying the reference transcript immediately followed
/// by an assistant turn carrying the reference audio; then one user turn per
/// chunk of the job transcript.
pub fn assemble(
    transcript: &str,
    scene_prompt: Option<&str>,
    voice: Option<&VoiceReference>,
    chunking: &ChunkPolicy,
    codec: &dyn SpeechCodec,
) -> Result<ConditioningContext> {
    let scene = scene_prompt
        .map(str::to_string)
        .or_else(|| voice.and_then(|v| v.scene.clone()))
        .unwrap_or_else(|| DEFAULT_SCENE.to_string());

    let mut shared = vec![Turn::text(Role::System, scene)];

    if let Some(voice) = voice {
        let frames = codec.tokenize(&voice.samples, voice.sample_rate)?;
        debug!(
            "Encoded reference voice '{}' into {} frames",
            voice.id,
            frames.len()
        );
        shared.push(Turn::text(Role::User, voice.transcript.clone()));
        shared.push(Turn::audio(
            Role::Assistant,
            Arc::new(AudioTurn {
                samples: voice.samples.clone(),
                sample_rate: voice.sample_rate,
                frames,
            }),
        ));
    }

    let chunks = chunk_transcript(transcript, chunking);
    debug!("Transcript split into {} chunk(s)", chunks.len());

    Ok(ConditioningContext { shared, chunks })
}

/// Split the transcript according to the chunking policy. Always yields at
/// least one chunk for non-empty input.
pub fn chunk_transcript(transcript: &str, policy: &ChunkPolicy) -> Vec<String> {
    let trimmed = transcript.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match policy.method {
        ChunkMethod::None => vec![trimmed.to_string()],
        ChunkMethod::ByWord => chunk_by_word(trimmed, policy.max_words.max(1)),
        ChunkMethod::BySpeaker => chunk_by_speaker(trimmed, policy.max_turns.max(1)),
    }
}

fn is_sentence_break(ch: char) -> bool {
    matches!(
        ch,
        '.' | '!' | '?' | ';' | ':' | '。' | '！' | '？' | '；' | '：' | '\n'
    )
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if is_sentence_break(ch) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Group whole sentences into chunks of at most `max_words` words. A single
/// sentence over the limit is split at whitespace.
fn chunk_by_word(text: &str, max_words: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_words = 0usize;

    let mut flush = |current: &mut String, current_words: &mut usize, chunks: &mut Vec<String>| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
            *current_words = 0;
        }
    };

    for sentence in split_sentences(text) {
        let words = word_count(&sentence);

        if words > max_words {
            // Oversized sentence: flush what we have, then split it at
            // whitespace into max_words groups.
            flush(&mut current, &mut current_words, &mut chunks);
            let mut group: Vec<&str> = Vec::with_capacity(max_words);
            for word in sentence.split_whitespace() {
                group.push(word);
                if group.len() == max_words {
                    chunks.push(group.join(" "));
                    group.clear();
                }
            }
            if !group.is_empty() {
                chunks.push(group.join(" "));
            }
            continue;
        }

        if current_words + words > max_words {
            flush(&mut current, &mut current_words, &mut chunks);
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
        current_words += words;
    }
    flush(&mut current, &mut current_words, &mut chunks);

    if chunks.is_empty() {
        vec![text.to_string()]
    } else {
        chunks
    }
}

/// Split on `[SPEAKERn]` line markers, grouping at most `max_turns` speaker
/// turns per chunk. A transcript without markers collapses to one chunk.
fn chunk_by_speaker(text: &str, max_turns: usize) -> Vec<String> {
    let mut turns: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let starts_turn = text::parse_speaker_tag(line.trim_start()).is_some();
        if starts_turn && !current.trim().is_empty() {
            turns.push(current.trim().to_string());
            current.clear();
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        turns.push(current.trim().to_string());
    }

    if turns.len() <= 1 {
        return vec![text.to_string()];
    }

    turns
        .chunks(max_turns)
        .map(|group| group.join("\n"))
        .collect()
}
