//! Shared fixtures for the integration suites
//!
//! Every suite runs against [`HostBackend`] so assertions about live
//! handles and release counts are exact.

use ndscope::{Device, HostBackend, RuntimeConfig, ScopeRuntime};
use std::sync::Arc;

/// Runtime over a fresh host backend, with a handle to the backend kept
/// out so tests can inspect allocation bookkeeping.
pub fn runtime() -> (ScopeRuntime, Arc<HostBackend>) {
    let backend = Arc::new(HostBackend::new());
    let runtime = ScopeRuntime::new(backend.clone(), RuntimeConfig::default());
    (runtime, backend)
}

/// Same, but with a non-default process device.
#[allow(dead_code)]
pub fn runtime_on(device: Device) -> (ScopeRuntime, Arc<HostBackend>) {
    let backend = Arc::new(HostBackend::new());
    let runtime = ScopeRuntime::new(
        backend.clone(),
        RuntimeConfig::default().with_default_device(device),
    );
    (runtime, backend)
}
