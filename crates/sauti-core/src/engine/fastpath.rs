//! Precompiled inference fast paths keyed by bucketed context length.
//!
//! Each bucket owns a pre-sized KV workspace and, when graph capture is
//! enabled and supported, a captured handle for single decode steps. Entries
//! live for the worker's lifetime and are reused across jobs under the
//! lifecycle manager's exclusive acquire.

use candle_core::{DType, Device};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{CapturedGraph, GenerationModel, KvWorkspace};
use crate::types::FastPathKind;

pub struct FastPathEntry {
    pub bucket: usize,
    pub workspace: KvWorkspace,
    pub graph: Option<Box<dyn CapturedGraph>>,
    pub healthy: bool,
}

/// The selected path for one chunk.
pub enum Selection<'a> {
    /// A bucketed entry; `use_graph` distinguishes captured from plain.
    Bucketed {
        entry: &'a mut FastPathEntry,
        use_graph: bool,
    },
    /// No bucket fits: caller allocates a dynamic workspace.
    Dynamic,
}

impl Selection<'_> {
    pub fn kind(&self) -> FastPathKind {
        match self {
            Selection::Bucketed { use_graph: true, .. } => FastPathKind::Captured,
            Selection::Bucketed { use_graph: false, .. } => FastPathKind::Workspace,
            Selection::Dynamic => FastPathKind::Dynamic,
        }
    }
}

pub struct FastPathCache {
    entries: Vec<FastPathEntry>,
}

impl FastPathCache {
    /// Allocate and warm every configured bucket: workspace, one dummy
    /// forward pass, and an optional graph capture. A bucket that fails
    /// warm-up is kept but marked unavailable; a failed smallest bucket is
    /// fatal since the worker would have no usable fast path for short
    /// contexts.
    pub fn warm(
        model: &dyn GenerationModel,
        buckets: &[usize],
        capture_graphs: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let spec = model.workspace_spec();
        let warmup_ids = model.encode_text("warm-up")?;
        let mut entries = Vec::with_capacity(buckets.len());

        for (index, &bucket) in buckets.iter().enumerate() {
            let outcome = (|| -> Result<FastPathEntry> {
                let mut workspace = KvWorkspace::allocate(spec, Some(bucket), device, dtype)?;
                model.prefill(&warmup_ids, &mut workspace)?;
                workspace.reset();

                let graph = if capture_graphs {
                    model.capture_graph(bucket, &mut workspace)?
                } else {
                    None
                };
                workspace.reset();

                debug!(
                    bucket,
                    captured = graph.is_some(),
                    "Warmed fast-path bucket"
                );
                Ok(FastPathEntry {
                    bucket,
                    workspace,
                    graph,
                    healthy: true,
                })
            })();

            match outcome {
                Ok(entry) => entries.push(entry),
                Err(err) if index == 0 => {
                    return Err(Error::ModelError(format!(
                        "smallest bucket {bucket} failed warm-up: {err}"
                    )));
                }
                Err(err) => {
                    warn!("Bucket {bucket} failed warm-up, marking unavailable: {err}");
                    entries.push(FastPathEntry {
                        bucket,
                        workspace: KvWorkspace::allocate(spec, Some(1), device, dtype)?,
                        graph: None,
                        healthy: false,
                    });
                }
            }
        }

        info!(
            "Fast-path cache ready: {}/{} buckets healthy",
            entries.iter().filter(|e| e.healthy).count(),
            entries.len()
        );
        Ok(Self { entries })
    }

    /// Select the path for a context of length `len`: the smallest healthy
    /// bucket that fits, captured when a graph exists (and the caller allows
    /// it), otherwise the dynamic fallback.
    pub fn select(&mut self, len: usize, allow_captured: bool) -> Selection<'_> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.healthy && entry.bucket >= len);

        match position {
            Some(index) => {
                let entry = &mut self.entries[index];
                let use_graph = allow_captured && entry.graph.is_some();
                Selection::Bucketed { entry, use_graph }
            }
            None => Selection::Dynamic,
        }
    }

    pub fn buckets(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.bucket).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::reference::ReferenceModel;

    fn warmed(capture: bool) -> FastPathCache {
        let model = ReferenceModel::default();
        FastPathCache::warm(
            &model,
            &[128, 256, 512, 1024, 2048, 4096],
            capture,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap()
    }

    #[test]
    fn bucket_edge_selects_that_bucket() {
        let mut cache = warmed(false);
        match cache.select(128, true) {
            Selection::Bucketed { entry, use_graph } => {
                assert_eq!(entry.bucket, 128);
                assert!(!use_graph);
            }
            Selection::Dynamic => panic!("128 must fit the 128 bucket"),
        }
    }

    #[test]
    fn bucket_plus_one_selects_next() {
        let mut cache = warmed(false);
        match cache.select(129, true) {
            Selection::Bucketed { entry, .. } => assert_eq!(entry.bucket, 256),
            Selection::Dynamic => panic!("129 must fit the 256 bucket"),
        }
    }

    #[test]
    fn above_largest_bucket_goes_dynamic() {
        let mut cache = warmed(false);
        assert!(matches!(cache.select(4097, true), Selection::Dynamic));
        assert_eq!(cache.select(4097, true).kind(), FastPathKind::Dynamic);
    }

    #[test]
    fn captured_graph_preferred_when_allowed() {
        let mut cache = warmed(true);
        assert_eq!(cache.select(64, true).kind(), FastPathKind::Captured);
        // The empty-chunk retry path forbids the captured graph.
        assert_eq!(cache.select(64, false).kind(), FastPathKind::Workspace);
    }

    #[test]
    fn buckets_report_in_order() {
        let cache = warmed(false);
        assert_eq!(cache.buckets(), vec![128, 256, 512, 1024, 2048, 4096]);
    }
}
