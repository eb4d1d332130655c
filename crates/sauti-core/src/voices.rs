//! Directory-backed catalog of named reference voices.
//!
//! Layout: one `<id>.wav` plus a sibling `<id>.txt` per voice under the
//! registry root; an optional root-level `profile.json` maps ids to default
//! scene descriptions. The index is built on first lookup and is read-only
//! afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::audio::decode_wav_bytes;
use crate::error::{Error, Result};

const MAX_SUGGESTIONS: usize = 5;
const PROFILE_FILE: &str = "profile.json";

/// A resolved reference voice: waveform, ground-truth transcript, and the
/// optional default scene from the profile.
#[derive(Debug, Clone)]
pub struct VoiceReference {
    pub id: String,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub transcript: String,
    pub scene: Option<String>,
}

#[derive(Debug, Clone)]
struct VoiceFiles {
    audio: PathBuf,
    transcript: PathBuf,
    scene: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Profile {
    #[serde(flatten)]
    scenes: HashMap<String, String>,
}

pub struct VoiceRegistry {
    root: PathBuf,
    index: OnceCell<HashMap<String, VoiceFiles>>,
    loaded: RwLock<HashMap<String, Arc<VoiceReference>>>,
}

impl VoiceRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: OnceCell::new(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// All known voice ids, sorted.
    pub async fn ids(&self) -> Result<Vec<String>> {
        let index = self.index().await?;
        let mut ids: Vec<String> = index.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.index().await?.contains_key(id))
    }

    /// Nearest known ids for an unknown request, for error ergonomics.
    pub async fn suggestions(&self, id: &str) -> Result<Vec<String>> {
        let index = self.index().await?;
        Ok(suggest(index.keys(), id))
    }

    /// Resolve an id to its loaded reference, decoding the audio and reading
    /// the transcript on first touch and caching the result.
    pub async fn resolve(&self, id: &str) -> Result<Arc<VoiceReference>> {
        if let Some(found) = self.loaded.read().expect("voice cache poisoned").get(id) {
            return Ok(found.clone());
        }

        let index = self.index().await?;
        let files = match index.get(id) {
            Some(files) => files.clone(),
            None => {
                return Err(Error::UnknownVoice {
                    requested: id.to_string(),
                    suggestions: suggest(index.keys(), id),
                })
            }
        };

        let wav_bytes = tokio::fs::read(&files.audio).await?;
        let (samples, sample_rate) = decode_wav_bytes(&wav_bytes).map_err(|e| {
            Error::Internal(format!("voice '{id}': {e}"))
        })?;
        let transcript = tokio::fs::read_to_string(&files.transcript).await?;
        let transcript = transcript.trim().to_string();

        let reference = Arc::new(VoiceReference {
            id: id.to_string(),
            samples,
            sample_rate,
            transcript,
            scene: files.scene,
        });

        self.loaded
            .write()
            .expect("voice cache poisoned")
            .insert(id.to_string(), reference.clone());
        Ok(reference)
    }

    async fn index(&self) -> Result<&HashMap<String, VoiceFiles>> {
        self.index.get_or_try_init(|| self.scan()).await
    }

    /// One-time directory scan. Duplicate ids keep the lexicographically
    /// first audio file.
    async fn scan(&self) -> Result<HashMap<String, VoiceFiles>> {
        let profile = self.load_profile().await;

        let mut audio_files: Vec<PathBuf> = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            Error::ConfigMissing(format!(
                "voice registry {}: {e}",
                self.root.display()
            ))
        })?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("wav") {
                audio_files.push(path);
            }
        }
        audio_files.sort();

        let mut index = HashMap::new();
        for audio in audio_files {
            let Some(id) = audio.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if index.contains_key(&id) {
                warn!("Duplicate voice id '{id}', keeping first file");
                continue;
            }
            let transcript = audio.with_extension("txt");
            if !transcript.exists() {
                warn!(
                    "Voice '{id}' has no transcript at {}, skipping",
                    transcript.display()
                );
                continue;
            }
            let scene = profile.scenes.get(&id).cloned();
            index.insert(
                id,
                VoiceFiles {
                    audio,
                    transcript,
                    scene,
                },
            );
        }

        debug!("Voice registry warmed with {} voices", index.len());
        Ok(index)
    }

    async fn load_profile(&self) -> Profile {
        let path = self.root.join(PROFILE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Ignoring malformed {}: {e}", path.display());
                    Profile::default()
                }
            },
            Err(_) => Profile::default(),
        }
    }
}

/// Rank known ids by closeness to the requested one: prefix and substring
/// matches first, then small edit distances.
fn suggest<'a>(known: impl Iterator<Item = &'a String>, requested: &str) -> Vec<String> {
    let requested_lower = requested.to_ascii_lowercase();
    let mut scored: Vec<(usize, String)> = Vec::new();

    for id in known {
        let id_lower = id.to_ascii_lowercase();
        let score = if id_lower.starts_with(&requested_lower)
            || requested_lower.starts_with(&id_lower)
        {
            0
        } else if id_lower.contains(&requested_lower) || requested_lower.contains(&id_lower) {
            1
        } else {
            let dist = levenshtein(&id_lower, &requested_lower);
            if dist > id_lower.len().max(requested_lower.len()) / 2 {
                continue;
            }
            1 + dist
        };
        scored.push((score, id.clone()));
    }

    scored.sort();
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, id)| id)
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode_wav;
    use std::path::Path;

    fn write_voice(dir: &Path, id: &str, seconds: f32, transcript: &str) {
        let samples: Vec<f32> = (0..(24_000.0 * seconds) as usize)
            .map(|i| (i as f32 * 0.01).sin() * 0.4)
            .collect();
        let bytes = encode_wav(&samples, 24_000).unwrap();
        std::fs::write(dir.join(format!("{id}.wav")), bytes).unwrap();
        std::fs::write(dir.join(format!("{id}.txt")), transcript).unwrap();
    }

    #[tokio::test]
    async fn scans_and_resolves_voices() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "belinda", 2.1, "Quick brown fox.");
        write_voice(dir.path(), "chadwick", 1.0, "Hello there.");

        let registry = VoiceRegistry::new(dir.path());
        assert_eq!(registry.ids().await.unwrap(), vec!["belinda", "chadwick"]);

        let voice = registry.resolve("belinda").await.unwrap();
        assert_eq!(voice.transcript, "Quick brown fox.");
        assert_eq!(voice.sample_rate, 24_000);
        assert!(voice.samples.len() > 24_000);
        assert!(voice.scene.is_none());

        // Second resolve hits the cache and returns the same allocation.
        let again = registry.resolve("belinda").await.unwrap();
        assert!(Arc::ptr_eq(&voice, &again));
    }

    #[tokio::test]
    async fn missing_transcript_skips_voice() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "good", 0.5, "ok");
        let samples = encode_wav(&[0.0; 100], 24_000).unwrap();
        std::fs::write(dir.path().join("orphan.wav"), samples).unwrap();

        let registry = VoiceRegistry::new(dir.path());
        assert_eq!(registry.ids().await.unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn unknown_voice_suggests_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "belinda", 0.5, "x");
        write_voice(dir.path(), "vex", 0.5, "y");

        let registry = VoiceRegistry::new(dir.path());
        let err = registry.resolve("belinduh").await.unwrap_err();
        match err {
            Error::UnknownVoice { requested, suggestions } => {
                assert_eq!(requested, "belinduh");
                assert!(suggestions.contains(&"belinda".to_string()));
            }
            other => panic!("expected UnknownVoice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn profile_supplies_default_scene() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "belinda", 0.5, "x");
        std::fs::write(
            dir.path().join("profile.json"),
            r#"{"belinda": "Recorded in a sunlit studio."}"#,
        )
        .unwrap();

        let registry = VoiceRegistry::new(dir.path());
        let voice = registry.resolve("belinda").await.unwrap();
        assert_eq!(voice.scene.as_deref(), Some("Recorded in a sunlit studio."));
    }

    #[tokio::test]
    async fn missing_registry_dir_is_config_error() {
        let registry = VoiceRegistry::new("/definitely/not/here");
        let err = registry.ids().await.unwrap_err();
        assert_eq!(err.kind(), "ConfigMissing");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("belinda", "belinduh"), 2);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn suggest_prefers_prefix_matches() {
        let known = vec![
            "belinda".to_string(),
            "belle".to_string(),
            "zack".to_string(),
        ];
        let out = suggest(known.iter(), "bel");
        assert_eq!(out[0], "belinda");
        assert!(out.contains(&"belle".to_string()));
        assert!(!out.contains(&"zack".to_string()));
    }
}
