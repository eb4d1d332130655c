//! Model lifecycle: one GPU-resident model per worker, loaded once and
//! handed to generation drivers under single-writer semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use candle_core::{DType, Device};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::device;
use crate::engine::fastpath::FastPathCache;
use crate::error::{Error, Result};
use crate::model::{GenerationModel, ModelLoader, SpeechCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Draining,
    Failed,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loading => "loading",
            LifecycleState::Ready => "ready",
            LifecycleState::Draining => "draining",
            LifecycleState::Failed => "failed",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Device-resident state: the model plus its fast-path cache. Exclusively
/// owned by whoever holds the acquire guard; the cache workspaces and
/// captured graphs are not re-entrant.
pub struct GpuSession {
    pub model: Box<dyn GenerationModel>,
    pub fastpath: FastPathCache,
    pub device: Device,
    pub dtype: DType,
}

/// Scoped exclusive access to the device. Dropping the guard releases on
/// every exit path, including panics and errors.
pub struct DeviceGuard {
    guard: OwnedMutexGuard<Option<GpuSession>>,
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard").finish_non_exhaustive()
    }
}

impl DeviceGuard {
    pub fn session(&mut self) -> Result<&mut GpuSession> {
        self.guard.as_mut().ok_or(Error::ShuttingDown)
    }
}

pub struct ModelLifecycle {
    state: watch::Sender<LifecycleState>,
    session: Arc<Mutex<Option<GpuSession>>>,
    codec: RwLock<Option<Arc<dyn SpeechCodec>>>,
    acquires: AtomicU64,
}

impl Default for ModelLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self {
            state,
            session: Arc::new(Mutex::new(None)),
            codec: RwLock::new(None),
            acquires: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Times a driver successfully acquired the device. Observable so tests
    /// can assert that rejected jobs never touch the accelerator.
    pub fn acquire_count(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    /// Load the model and codec, then warm the fast-path cache. Any error is
    /// terminal: the state moves to `Failed` and the worker must restart.
    pub async fn start(&self, cfg: &EngineConfig, loader: &dyn ModelLoader) -> Result<()> {
        let moved = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Uninitialized {
                *state = LifecycleState::Loading;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(Error::Internal(format!(
                "start() called in state {:?}",
                self.state()
            )));
        }

        match self.load(cfg, loader).await {
            Ok(()) => {
                self.state.send_replace(LifecycleState::Ready);
                info!("Model lifecycle ready");
                Ok(())
            }
            Err(err) => {
                error!("Model load failed, worker must be restarted: {err}");
                self.state.send_replace(LifecycleState::Failed);
                Err(err)
            }
        }
    }

    async fn load(&self, cfg: &EngineConfig, loader: &dyn ModelLoader) -> Result<()> {
        let device = device::select_device(&cfg.device)?;
        let dtype = cfg.precision.dtype();

        info!(
            "Loading model from {} ({} {:?})",
            cfg.model_dir.display(),
            device::label(&device),
            dtype
        );
        let model = loader.load_model(cfg, &device)?;
        let codec = loader.load_codec(cfg, &device)?;

        let fastpath = FastPathCache::warm(
            model.as_ref(),
            &cfg.length_buckets,
            cfg.capture_graphs,
            &device,
            dtype,
        )?;

        *self.codec.write().expect("codec lock poisoned") = Some(codec);
        *self.session.lock().await = Some(GpuSession {
            model,
            fastpath,
            device,
            dtype,
        });
        Ok(())
    }

    /// The audio codec. Immutable after load; concurrent use is safe.
    pub fn codec(&self) -> Result<Arc<dyn SpeechCodec>> {
        self.codec
            .read()
            .expect("codec lock poisoned")
            .clone()
            .ok_or(Error::ShuttingDown)
    }

    /// Block until the worker is Ready and exclusive device access is
    /// granted. Fails with `ShuttingDown` once draining begins and with
    /// `ModelError` if the load failed.
    pub async fn acquire(&self) -> Result<DeviceGuard> {
        let mut rx = self.state.subscribe();
        let state = {
            let state = rx
                .wait_for(|state| {
                    !matches!(
                        state,
                        LifecycleState::Uninitialized | LifecycleState::Loading
                    )
                })
                .await
                .map_err(|_| Error::ShuttingDown)?;
            *state
        };

        match state {
            LifecycleState::Ready => {}
            LifecycleState::Failed => {
                return Err(Error::ModelError(
                    "model failed to load; worker must be restarted".to_string(),
                ))
            }
            _ => return Err(Error::ShuttingDown),
        }

        let guard = self.session.clone().lock_owned().await;

        // The state may have moved to Draining while we waited on the lock.
        if self.state() != LifecycleState::Ready {
            return Err(Error::ShuttingDown);
        }
        if guard.is_none() {
            return Err(Error::ShuttingDown);
        }

        self.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceGuard { guard })
    }

    /// Drain: refuse new acquisitions, wait for the current holder, free
    /// device memory, and stop.
    pub async fn shutdown(&self) {
        let draining = self.state.send_if_modified(|state| {
            if matches!(*state, LifecycleState::Ready | LifecycleState::Loading) {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        });
        if draining {
            info!("Draining: waiting for in-flight generation to finish");
        }

        let mut session = self.session.lock().await;
        session.take();
        drop(session);

        self.codec.write().expect("codec lock poisoned").take();
        self.state.send_replace(LifecycleState::Stopped);
        info!("Model lifecycle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::reference::ReferenceLoader;

    fn test_cfg() -> EngineConfig {
        EngineConfig::with_dirs("/tmp/m", "/tmp/c", "/tmp/v")
    }

    #[tokio::test]
    async fn start_reaches_ready_and_serves_codec() {
        let lifecycle = ModelLifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        assert_eq!(lifecycle.codec().unwrap().sample_rate(), 24_000);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let lifecycle = ModelLifecycle::new();
        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();
        assert!(lifecycle.start(&test_cfg(), &ReferenceLoader).await.is_err());
    }

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let lifecycle = Arc::new(ModelLifecycle::new());
        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();

        let mut first = lifecycle.acquire().await.unwrap();
        assert!(first.session().is_ok());

        // A second acquire must not complete while the first guard is held.
        let contender = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap().unwrap();
        assert_eq!(lifecycle.acquire_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_acquires() {
        let lifecycle = ModelLifecycle::new();
        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();
        lifecycle.shutdown().await;

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        let err = lifecycle.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "ShuttingDown");
        assert!(lifecycle.codec().is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_holder() {
        let lifecycle = Arc::new(ModelLifecycle::new());
        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();

        let guard = lifecycle.acquire().await.unwrap();
        let shutter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.shutdown().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!shutter.is_finished());
        assert_eq!(lifecycle.state(), LifecycleState::Draining);

        drop(guard);
        shutter.await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn acquire_before_ready_waits_for_start() {
        let lifecycle = Arc::new(ModelLifecycle::new());

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lifecycle.start(&test_cfg(), &ReferenceLoader).await.unwrap();
        waiter.await.unwrap().unwrap();
    }
}
