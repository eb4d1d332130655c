//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use sauti_core::{EngineConfig, JobRunner, ModelLifecycle, VoiceRegistry};

/// State handed to every request handler. Cheap to clone; everything shared
/// sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
    pub lifecycle: Arc<ModelLifecycle>,
    pub voices: Arc<VoiceRegistry>,
    /// Bounds concurrently processed jobs; generation itself still
    /// serializes on the device.
    pub job_semaphore: Arc<Semaphore>,
    pub device: String,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        cfg: EngineConfig,
        lifecycle: Arc<ModelLifecycle>,
        voices: Arc<VoiceRegistry>,
    ) -> Self {
        let max_concurrent = std::env::var("SAUTI_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(8);

        let device = cfg.device.clone();
        let runner = Arc::new(JobRunner::new(cfg, lifecycle.clone(), voices.clone()));

        Self {
            runner,
            lifecycle,
            voices,
            job_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            device,
            started: Instant::now(),
        }
    }
}
