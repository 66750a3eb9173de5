//! Leaf resource: a native array handle owned by a scope

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::{NativeBackend, NativeHandle, NativeTensor};
use crate::device::Device;
use crate::error::NdResult;
use crate::invalid_argument;
use crate::scope::{transfer_resource, NdScope, ResourceId, ScopeInner, ScopedResource};
use crate::tensor::{DataType, Shape, SparseFormat};

pub(crate) struct ArrayInner {
    id: ResourceId,
    handle: NativeHandle,
    dtype: DataType,
    shape: Shape,
    device: Device,
    format: SparseFormat,
    backend: Arc<dyn NativeBackend>,
    released: AtomicBool,
    /// Owning scope. Weak so an orphaned array never keeps a closed scope
    /// alive; empty after a detach.
    owner: Mutex<Weak<ScopeInner>>,
}

impl ArrayInner {
    fn close_impl(&self) -> NdResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.backend.release(self.handle);

        // Take the owner out before touching its registry so the two locks
        // are never held together.
        let owner = { self.owner.lock()?.clone() };
        if let Some(scope) = owner.upgrade() {
            scope.detach_quiet(self.id);
        }
        tracing::trace!(array = %self.id, handle = %self.handle, "released array");
        result
    }
}

impl ScopedResource for ArrayInner {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn release(&self) -> NdResult<()> {
        self.close_impl()
    }
}

/// Handle to a natively-allocated n-dimensional array.
///
/// `NdArray` is a cheap clonable handle; all clones refer to the same
/// native buffer and the same released flag. The array's memory is freed
/// either by an explicit [`NdArray::close`] or by the cascade of its owning
/// scope, whichever comes first.
#[derive(Clone)]
pub struct NdArray {
    pub(crate) inner: Arc<ArrayInner>,
}

impl NdArray {
    pub(crate) fn from_tensor(
        tensor: NativeTensor,
        backend: Arc<dyn NativeBackend>,
        owner: &Arc<ScopeInner>,
    ) -> NdArray {
        NdArray {
            inner: Arc::new(ArrayInner {
                id: ResourceId::next(),
                handle: tensor.handle,
                dtype: tensor.dtype,
                shape: tensor.shape,
                device: tensor.device,
                format: tensor.format,
                backend,
                released: AtomicBool::new(false),
                owner: Mutex::new(Arc::downgrade(owner)),
            }),
        }
    }

    /// Release the native buffer.
    ///
    /// Idempotent; the owning scope is told to forget the array so its
    /// later cascade does not see it again. A backend release failure is
    /// returned, but the array still counts as released and is never
    /// retried.
    pub fn close(&self) -> NdResult<()> {
        self.inner.close_impl()
    }

    /// Move this array into `target`, detaching it from its current scope.
    ///
    /// After the move the array's lifetime is bound to `target`'s cascade.
    /// Fails with `ScopeClosed` (leaving ownership unchanged) if `target`
    /// has already been closed, and with `InvalidArgument` if the array has
    /// already been released.
    pub fn move_to(&self, target: &NdScope) -> NdResult<()> {
        if self.is_released() {
            return Err(invalid_argument!(
                "array {} has already been released",
                self.inner.id
            ));
        }
        let resource = self.inner.clone() as Arc<dyn ScopedResource>;

        // The owner lock is held across the transfer so two concurrent
        // moves of the same array cannot interleave.
        let mut owner = self.inner.owner.lock()?;
        match owner.upgrade() {
            Some(current) if Arc::ptr_eq(&current, &target.inner) => return Ok(()),
            Some(current) => {
                transfer_resource(&current, &target.inner, self.inner.id, resource)?;
            }
            None => {
                target.inner.attach_resource(resource)?;
            }
        }
        *owner = Arc::downgrade(&target.inner);
        Ok(())
    }

    pub(crate) fn clear_owner(&self) -> NdResult<()> {
        let mut owner = self.inner.owner.lock()?;
        *owner = Weak::new();
        Ok(())
    }

    /// Array identity within the process
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Backend handle for the native buffer
    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    /// Element datatype
    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    /// Dimensions
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    /// Placement of the native buffer
    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Physical storage format
    pub fn sparse_format(&self) -> SparseFormat {
        self.inner.format
    }

    /// Whether the native buffer has been freed
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// The scope currently responsible for this array, if any
    pub fn scope(&self) -> Option<NdScope> {
        let owner = self.inner.owner.lock().ok()?;
        owner.upgrade().map(|inner| NdScope { inner })
    }

    pub(crate) fn to_native_tensor(&self) -> NativeTensor {
        NativeTensor {
            handle: self.inner.handle,
            dtype: self.inner.dtype,
            shape: self.inner.shape.clone(),
            device: self.inner.device,
            format: self.inner.format,
        }
    }
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape.to_string())
            .field("device", &self.inner.device)
            .field("format", &self.inner.format)
            .field("released", &self.is_released())
            .finish()
    }
}
