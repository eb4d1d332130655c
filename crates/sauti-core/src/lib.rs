//! sauti-core — inference control plane for a serverless text-to-speech
//! worker.
//!
//! One worker process owns one GPU-resident generation model, an audio
//! codec, and precompiled fast paths, and serves one audio-generation job
//! per invocation:
//!
//! 1. [`config::EngineConfig`] resolves environment configuration once at
//!    startup.
//! 2. [`validate`] rejects bad payloads before any device work.
//! 3. [`voices::VoiceRegistry`] catalogs reference voices from a directory.
//! 4. [`prompt`] assembles the conditioning dialogue and chunks long input.
//! 5. [`engine::ModelLifecycle`] loads the model once and serializes device
//!    access; [`engine::FastPathCache`] keeps per-bucket KV workspaces and
//!    captured graphs.
//! 6. [`engine::generation`] drives the two-alphabet sampling loop.
//! 7. [`audio`] assembles chunk waveforms into one WAV container.
//! 8. [`sink::ArtifactSink`] returns audio inline or uploads it.
//! 9. [`job::JobRunner`] composes the above per job.
//!
//! The generation model and codec are consumed through the seams in
//! [`model`]; the in-tree [`backends::reference`] backend implements them
//! deterministically for tests and CPU fallback.

pub mod audio;
pub mod backends;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod job;
pub mod model;
pub mod prompt;
pub mod sink;
pub mod text;
pub mod types;
pub mod validate;
pub mod voices;

pub use config::{EngineConfig, ObjectStoreConfig, Precision};
pub use engine::{LifecycleState, ModelLifecycle};
pub use error::{Error, Result};
pub use job::JobRunner;
pub use sink::ArtifactSink;
pub use types::{JobRequest, JobResponse};
pub use voices::VoiceRegistry;
