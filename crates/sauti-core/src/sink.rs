//! Result delivery: inline base64 or streaming upload to the object store.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tracing::{info, warn};

use crate::config::{EngineConfig, ObjectStoreConfig};
use crate::error::{Error, Result};
use crate::types::ResolvedSink;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Back-off jitter span: ±20%.
const JITTER_FRACTION: f64 = 0.2;

/// How the artifact reached the caller.
#[derive(Debug, Clone)]
pub enum Delivery {
    Inline { bytes_base64: String },
    External { url: String },
}

/// A transport failure, tagged with whether a retry can help. Transport
/// errors and 5xx responses retry; auth and other 4xx responses are terminal.
#[derive(Debug)]
pub struct TransportError {
    pub retriable: bool,
    pub message: String,
}

#[async_trait::async_trait]
pub trait BlobTransport: Send + Sync {
    async fn put(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
        store: &ObjectStoreConfig,
    ) -> std::result::Result<(), TransportError>;
}

/// reqwest-backed transport. One client per worker; safe for concurrent use.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BlobTransport for HttpTransport {
    async fn put(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
        store: &ObjectStoreConfig,
    ) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .put(url)
            .basic_auth(&store.access_key, Some(&store.secret_key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-store-region", &store.region)
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError {
                retriable: true,
                message: if err.is_timeout() {
                    "upload timed out".to_string()
                } else {
                    format!("upload failed: {err}")
                },
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(TransportError {
            retriable: status.is_server_error(),
            message: format!("upload failed with status {status}"),
        })
    }
}

/// Delivers one job's container bytes, inline or to the object store. The
/// upload completes before the success response is emitted.
pub struct ArtifactSink {
    inline_cap: usize,
    store: Option<ObjectStoreConfig>,
    transport: Arc<dyn BlobTransport>,
    backoff_base: Duration,
}

impl ArtifactSink {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self::with_transport(cfg, Arc::new(HttpTransport::new()))
    }

    /// Inject a transport; tests use this to script failures.
    pub fn with_transport(cfg: &EngineConfig, transport: Arc<dyn BlobTransport>) -> Self {
        Self {
            inline_cap: cfg.inline_cap_bytes,
            store: cfg.object_store.clone(),
            transport,
            backoff_base: BACKOFF_BASE,
        }
    }

    #[cfg(test)]
    fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Deliver the container bytes per the job's sink directive.
    pub async fn deliver(&self, bytes: Vec<u8>, sink: Option<&ResolvedSink>) -> Result<Delivery> {
        match sink {
            Some(target) => {
                let url = self.upload(&target.bucket, &target.key, bytes).await?;
                Ok(Delivery::External { url })
            }
            None => {
                if bytes.len() > self.inline_cap {
                    return Err(Error::PayloadTooLarge {
                        size: bytes.len(),
                        limit: self.inline_cap,
                    });
                }
                Ok(Delivery::Inline {
                    bytes_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                })
            }
        }
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        let store = self.store.as_ref().ok_or_else(|| {
            Error::ConfigMissing("object store credentials are not configured".to_string())
        })?;
        let key = key.trim_start_matches('/');
        let url = format!("{}/{bucket}/{key}", store.endpoint);

        let mut last_message = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .transport
                .put(&url, bytes.clone(), "audio/wav", store)
                .await
            {
                Ok(()) => {
                    info!("Uploaded artifact to {url} (attempt {attempt})");
                    return Ok(url);
                }
                Err(err) if err.retriable && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(self.backoff_base, attempt);
                    warn!(
                        "Upload attempt {attempt}/{MAX_ATTEMPTS} failed ({}), retrying in {:?}",
                        err.message, delay
                    );
                    last_message = err.message;
                    tokio::time::sleep(delay).await;
                }
                Err(err) if !err.retriable => {
                    return Err(Error::SinkUnavailable {
                        attempts: attempt,
                        message: err.message,
                    });
                }
                Err(err) => {
                    last_message = err.message;
                }
            }
        }

        Err(Error::SinkUnavailable {
            attempts: MAX_ATTEMPTS,
            message: last_message,
        })
    }
}

/// Exponential back-off with ±20% jitter: 500 ms, 1 s, ... before attempts
/// 2, 3, ...
fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};

    let exp = base.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as f64;
    let unit = nanos / 1e9; // [0, 1)
    let factor = 1.0 - JITTER_FRACTION + 2.0 * JITTER_FRACTION * unit;
    Duration::from_millis((exp * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct ScriptedTransport {
        /// Outcomes per attempt: `Some(retriable)` fails, `None` succeeds.
        script: Vec<Option<bool>>,
        calls: AtomicUsize,
        urls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Option<bool>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                urls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl BlobTransport for ScriptedTransport {
        async fn put(
            &self,
            url: &str,
            _body: Vec<u8>,
            _content_type: &str,
            _store: &ObjectStoreConfig,
        ) -> std::result::Result<(), TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            match self.script.get(n).copied().flatten() {
                None => Ok(()),
                Some(retriable) => Err(TransportError {
                    retriable,
                    message: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn cfg_with_store() -> EngineConfig {
        let mut cfg = EngineConfig::with_dirs("/m", "/c", "/v");
        cfg.object_store = Some(ObjectStoreConfig {
            endpoint: "https://store.example".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: "us-east-1".into(),
        });
        cfg
    }

    fn target() -> ResolvedSink {
        ResolvedSink {
            bucket: "bucket".into(),
            key: "out/audio.wav".into(),
        }
    }

    #[tokio::test]
    async fn inline_delivery_base64_encodes() {
        let cfg = EngineConfig::with_dirs("/m", "/c", "/v");
        let sink = ArtifactSink::with_transport(&cfg, ScriptedTransport::new(vec![]));
        match sink.deliver(vec![1, 2, 3], None).await.unwrap() {
            Delivery::Inline { bytes_base64 } => assert_eq!(bytes_base64, "AQID"),
            other => panic!("expected inline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inline_over_cap_is_payload_too_large() {
        let mut cfg = EngineConfig::with_dirs("/m", "/c", "/v");
        cfg.inline_cap_bytes = 4;
        let sink = ArtifactSink::with_transport(&cfg, ScriptedTransport::new(vec![]));
        let err = sink.deliver(vec![0; 5], None).await.unwrap_err();
        assert_eq!(err.kind(), "PayloadTooLarge");
    }

    #[tokio::test]
    async fn upload_succeeds_first_try() {
        let transport = ScriptedTransport::new(vec![None]);
        let sink = ArtifactSink::with_transport(&cfg_with_store(), transport.clone());
        match sink.deliver(vec![9; 16], Some(&target())).await.unwrap() {
            Delivery::External { url } => {
                assert_eq!(url, "https://store.example/bucket/out/audio.wav");
            }
            other => panic!("expected external, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let transport = ScriptedTransport::new(vec![Some(true), Some(true), None]);
        let sink = ArtifactSink::with_transport(&cfg_with_store(), transport.clone())
            .with_backoff_base(Duration::from_millis(50));

        let started = Instant::now();
        let delivery = sink.deliver(vec![7; 8], Some(&target())).await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(delivery, Delivery::External { .. }));
        assert_eq!(transport.calls(), 3);
        // Backoffs of ~50 ms and ~100 ms, each within ±20%.
        assert!(elapsed >= Duration::from_millis(120), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_sink_unavailable() {
        let transport = ScriptedTransport::new(vec![Some(true), Some(true), Some(true)]);
        let sink = ArtifactSink::with_transport(&cfg_with_store(), transport.clone())
            .with_backoff_base(Duration::from_millis(1));

        let err = sink
            .deliver(vec![1], Some(&target()))
            .await
            .unwrap_err();
        match err {
            Error::SinkUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected SinkUnavailable, got {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn terminal_failure_does_not_retry() {
        let transport = ScriptedTransport::new(vec![Some(false)]);
        let sink = ArtifactSink::with_transport(&cfg_with_store(), transport.clone());

        let err = sink.deliver(vec![1], Some(&target())).await.unwrap_err();
        assert_eq!(err.kind(), "SinkUnavailable");
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn backoff_delay_stays_within_jitter_band() {
        for attempt in 1..=2 {
            let delay = backoff_delay(Duration::from_millis(500), attempt).as_millis() as f64;
            let nominal = 500.0 * 2f64.powi(attempt as i32 - 1);
            assert!(delay >= nominal * 0.8 - 1.0, "attempt {attempt}: {delay}");
            assert!(delay <= nominal * 1.2 + 1.0, "attempt {attempt}: {delay}");
        }
    }
}
