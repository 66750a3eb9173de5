//! Native allocation gateway
//!
//! The scope tree never allocates or frees native memory itself; it talks to
//! a [`NativeBackend`] collaborator through this narrow seam. The backend
//! hands out opaque [`NativeHandle`]s and takes them back in `release`; the
//! core tracks *when* a handle is released, never what it contains.

pub mod host;

pub use host::HostBackend;

use crate::device::Device;
use crate::error::NdResult;
use crate::ops::OpParams;
use crate::tensor::{DataType, Shape, SparseFormat};
use std::fmt;
use std::path::Path;

/// Opaque reference to a block of natively-allocated memory.
///
/// Handles are issued by the backend and carry no meaning for the core
/// beyond identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A native handle together with the descriptors the core tracks for it.
#[derive(Debug, Clone)]
pub struct NativeTensor {
    /// Backend-issued memory reference
    pub handle: NativeHandle,
    /// Element datatype
    pub dtype: DataType,
    /// Dimensions
    pub shape: Shape,
    /// Placement
    pub device: Device,
    /// Physical storage format
    pub format: SparseFormat,
}

impl NativeTensor {
    /// Dense tensor descriptor
    pub fn dense(handle: NativeHandle, dtype: DataType, shape: Shape, device: Device) -> Self {
        NativeTensor {
            handle,
            dtype,
            shape,
            device,
            format: SparseFormat::Dense,
        }
    }
}

/// The computation/allocation collaborator the scope tree delegates to.
///
/// Implementations must be safe to call from multiple threads: cascading
/// close invokes `release` concurrently with allocation entry points on
/// other scopes.
pub trait NativeBackend: Send + Sync {
    /// Allocate a dense buffer for `shape` x `dtype` on `device`.
    fn allocate(&self, shape: &Shape, dtype: DataType, device: &Device) -> NdResult<NativeHandle>;

    /// Allocate a sparse buffer. `aux_handles` are already-allocated index
    /// arrays (e.g. CSR indptr/indices) the backend may bind to the result;
    /// their lifetime is managed by the caller's scope, not the backend.
    fn allocate_sparse(
        &self,
        format: SparseFormat,
        shape: &Shape,
        dtype: DataType,
        device: &Device,
        aux_handles: &[NativeHandle],
    ) -> NdResult<NativeHandle>;

    /// Run a named generator operator and return the tensor it produced.
    fn invoke(
        &self,
        op: &str,
        inputs: &[NativeHandle],
        params: &OpParams,
    ) -> NdResult<NativeTensor>;

    /// Copy raw bytes into an existing buffer. Pure passthrough; the core
    /// uses it only to populate sparse auxiliary index arrays.
    fn upload(&self, handle: NativeHandle, bytes: &[u8]) -> NdResult<()>;

    /// Release a handle's native memory.
    ///
    /// Invoked exactly once per handle, only from a leaf resource's own
    /// close. Must be idempotent-tolerant in the sense that a failure here
    /// is reported but never retried by the core.
    fn release(&self, handle: NativeHandle) -> NdResult<()>;

    /// Load every tensor stored at `path`. The caller attaches the results
    /// into a live scope; the backend owns the file format.
    fn load(&self, path: &Path) -> NdResult<Vec<NativeTensor>>;

    /// Persist the given tensors at `path`.
    fn save(&self, path: &Path, tensors: &[NativeTensor]) -> NdResult<()>;
}
