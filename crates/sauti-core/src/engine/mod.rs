//! The inference engine: lifecycle, fast paths, sampling, and the
//! generation loop.

pub mod fastpath;
pub mod generation;
pub mod lifecycle;
pub mod sampling;

pub use fastpath::{FastPathCache, FastPathEntry, Selection};
pub use generation::{run_chunk, ChunkOutcome, RunOptions};
pub use lifecycle::{DeviceGuard, GpuSession, LifecycleState, ModelLifecycle};
pub use sampling::{RasWindow, SamplingContext};
