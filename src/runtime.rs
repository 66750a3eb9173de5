//! Process-wide entry point for the scope tree
//!
//! A [`ScopeRuntime`] pairs a [`NativeBackend`] with the root sentinel of a
//! scope tree. Applications typically build one runtime at startup and open
//! a scope per unit of work.

use std::sync::Arc;

use crate::backend::NativeBackend;
use crate::device::Device;
use crate::error::NdResult;
use crate::scope::NdScope;

/// Runtime construction options.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Device used when neither a scope nor an allocation names one
    pub default_device: Device,
}

impl RuntimeConfig {
    /// Configuration with all defaults (CPU placement)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process-wide default device
    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }
}

/// Owner of a scope tree and its backend.
///
/// Cloning is cheap; clones share the same tree.
#[derive(Clone)]
pub struct ScopeRuntime {
    backend: Arc<dyn NativeBackend>,
    root: NdScope,
}

impl ScopeRuntime {
    /// Build a runtime around a backend.
    pub fn new(backend: Arc<dyn NativeBackend>, config: RuntimeConfig) -> Self {
        let root = NdScope::new_root(backend.clone(), config.default_device);
        tracing::debug!(device = %config.default_device, "scope runtime initialized");
        ScopeRuntime { backend, root }
    }

    /// The tree's root sentinel.
    ///
    /// Arrays created directly on the root are untracked: the caller must
    /// close them explicitly.
    pub fn root(&self) -> &NdScope {
        &self.root
    }

    /// Shared handle to the backend
    pub fn backend(&self) -> Arc<dyn NativeBackend> {
        self.backend.clone()
    }

    /// Open a top-level scope under the root.
    ///
    /// The scope uses the runtime's default device unless `device`
    /// overrides it.
    pub fn new_scope(&self, device: Option<Device>) -> NdResult<NdScope> {
        self.root.new_sub_scope(device)
    }
}
