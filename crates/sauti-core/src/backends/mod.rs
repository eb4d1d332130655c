//! Model/codec backends.
//!
//! The control plane talks to backends only through the seams in
//! [`crate::model`]. One backend ships in-tree: the deterministic CPU
//! reference backend, which the test suite drives and which serves as the
//! fallback when no accelerator backend is compiled in. Accelerator backends
//! slot in here by providing another [`ModelLoader`].

pub mod reference;

use crate::model::ModelLoader;

/// The loader the worker uses when nothing more specific is configured.
pub fn default_loader() -> Box<dyn ModelLoader> {
    Box::new(reference::ReferenceLoader)
}
