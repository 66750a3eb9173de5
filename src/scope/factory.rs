//! Allocation entry points on [`NdScope`]
//!
//! Every constructor here follows the same shape: fail fast if the scope is
//! closed, resolve the device, ask the backend for a tensor, then register
//! the result in the scope's registry. Registration re-checks liveness, so
//! an allocation that races a concurrent close frees its handle instead of
//! leaking it.

use std::sync::Arc;

use crate::backend::{NativeHandle, NativeTensor};
use crate::device::Device;
use crate::error::{NdResult, NdScopeError};
use crate::invalid_argument;
use crate::ops::{op, OpParams};
use crate::scope::{NdArray, NdScope, ScopedResource};
use crate::tensor::{DataType, Shape, SparseFormat};

impl NdScope {
    fn ensure_open(&self) -> NdResult<()> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(NdScopeError::ScopeClosed)
        }
    }

    fn resolve_device(&self, explicit: Option<Device>) -> Device {
        Device::default_if_none(explicit, self.inner.device)
    }

    /// Adopt a backend-produced tensor into this scope.
    ///
    /// If registration loses the race with a concurrent close, the fresh
    /// handle is released on the spot and `ScopeClosed` is returned.
    pub fn wrap(&self, tensor: NativeTensor) -> NdResult<NdArray> {
        let array = NdArray::from_tensor(tensor, self.inner.backend.clone(), &self.inner);
        let resource = array.inner.clone() as Arc<dyn ScopedResource>;
        if let Err(err) = self.inner.attach_resource(resource) {
            if let Err(release_err) = self.inner.backend.release(array.handle()) {
                tracing::warn!(
                    handle = %array.handle(),
                    error = %release_err,
                    "failed to release handle after losing attach race"
                );
            }
            return Err(err);
        }
        Ok(array)
    }

    /// Allocate an uninitialized dense array.
    pub fn create(
        &self,
        shape: Shape,
        dtype: DataType,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        let device = self.resolve_device(device);
        let handle = self.inner.backend.allocate(&shape, dtype, &device)?;
        self.wrap(NativeTensor::dense(handle, dtype, shape, device))
    }

    /// Allocate a compressed-sparse-row array.
    ///
    /// `indptr` and `indices` become I64 index arrays owned by this scope;
    /// they are released with the scope like any other array.
    pub fn create_csr(
        &self,
        shape: Shape,
        dtype: DataType,
        indptr: &[i64],
        indices: &[i64],
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        if shape.rank() != 2 {
            return Err(invalid_argument!(
                "CSR requires a rank-2 shape, got {}",
                shape
            ));
        }
        let device = self.resolve_device(device);
        let indptr_arr = self.index_array(indptr, device)?;
        let indices_arr = self.index_array(indices, device)?;
        self.sparse(
            SparseFormat::Csr,
            shape,
            dtype,
            device,
            &[indptr_arr.handle(), indices_arr.handle()],
        )
    }

    /// Allocate a row-sparse array where only the rows named by `indices`
    /// are materialized.
    pub fn create_row_sparse(
        &self,
        shape: Shape,
        dtype: DataType,
        indices: &[i64],
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        let rows = shape.dims().first().copied().unwrap_or(0);
        if indices.len() > rows {
            return Err(invalid_argument!(
                "{} row indices exceed {} rows of shape {}",
                indices.len(),
                rows,
                shape
            ));
        }
        let device = self.resolve_device(device);
        let indices_arr = self.index_array(indices, device)?;
        self.sparse(
            SparseFormat::RowSparse,
            shape,
            dtype,
            device,
            &[indices_arr.handle()],
        )
    }

    fn index_array(&self, values: &[i64], device: Device) -> NdResult<NdArray> {
        let shape = Shape::of(&[values.len()]);
        let handle = self
            .inner
            .backend
            .allocate(&shape, DataType::I64, &device)?;
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        if let Err(err) = self.inner.backend.upload(handle, &bytes) {
            self.release_orphan(handle);
            return Err(err);
        }
        self.wrap(NativeTensor::dense(handle, DataType::I64, shape, device))
    }

    fn sparse(
        &self,
        format: SparseFormat,
        shape: Shape,
        dtype: DataType,
        device: Device,
        aux: &[NativeHandle],
    ) -> NdResult<NdArray> {
        let handle = self
            .inner
            .backend
            .allocate_sparse(format, &shape, dtype, &device, aux)?;
        self.wrap(NativeTensor {
            handle,
            dtype,
            shape,
            device,
            format,
        })
    }

    /// Array filled with zeros.
    pub fn zeros(
        &self,
        shape: Shape,
        dtype: DataType,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.fill(op::ZEROS, shape, dtype, device)
    }

    /// Array filled with ones.
    pub fn ones(
        &self,
        shape: Shape,
        dtype: DataType,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.fill(op::ONES, shape, dtype, device)
    }

    fn fill(
        &self,
        op_name: &str,
        shape: Shape,
        dtype: DataType,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_shape("shape", shape)
            .set_dtype(dtype)
            .set_device(device);
        let tensor = self.inner.backend.invoke(op_name, &[], &params)?;
        self.wrap(tensor)
    }

    /// Evenly spaced values in the half-open interval `[start, stop)`.
    ///
    /// `dtype` defaults to F32. A zero `step` is rejected.
    pub fn arange(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        dtype: Option<DataType>,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        if step == 0.0 {
            return Err(invalid_argument!("arange step must be non-zero"));
        }
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_float("start", start)
            .set_float("stop", stop)
            .set_float("step", step)
            .set_dtype(dtype.unwrap_or(DataType::F32))
            .set_device(device);
        let tensor = self.inner.backend.invoke(op::ARANGE, &[], &params)?;
        self.wrap(tensor)
    }

    /// Identity-like matrix of `rows` x `cols` with ones on the diagonal
    /// offset by `k`.
    pub fn eye(
        &self,
        rows: usize,
        cols: usize,
        k: i64,
        dtype: Option<DataType>,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_int("rows", rows as i64)
            .set_int("cols", cols as i64)
            .set_int("k", k)
            .set_dtype(dtype.unwrap_or(DataType::F32))
            .set_device(device);
        let tensor = self.inner.backend.invoke(op::EYE, &[], &params)?;
        self.wrap(tensor)
    }

    /// `num` evenly spaced F32 values from `start` to `stop`.
    ///
    /// With `endpoint`, `stop` is the last value; without it the interval
    /// is half-open. The result is always F32.
    pub fn linspace(
        &self,
        start: f64,
        stop: f64,
        num: usize,
        endpoint: bool,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_float("start", start)
            .set_float("stop", stop)
            .set_int("num", num as i64)
            .set_bool("endpoint", endpoint)
            .set_device(device);
        let tensor = self.inner.backend.invoke(op::LINSPACE, &[], &params)?;
        self.wrap(tensor)
    }

    /// Samples from the uniform distribution over `[low, high)`.
    pub fn random_uniform(
        &self,
        low: f64,
        high: f64,
        shape: Shape,
        dtype: Option<DataType>,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        if low > high {
            return Err(invalid_argument!(
                "uniform bounds are inverted: low {} > high {}",
                low,
                high
            ));
        }
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_float("low", low)
            .set_float("high", high)
            .set_shape("shape", shape)
            .set_dtype(dtype.unwrap_or(DataType::F32))
            .set_device(device);
        let tensor = self
            .inner
            .backend
            .invoke(op::RANDOM_UNIFORM, &[], &params)?;
        self.wrap(tensor)
    }

    /// Samples from the normal distribution with mean `loc` and standard
    /// deviation `scale`. A negative `scale` is rejected.
    pub fn random_normal(
        &self,
        loc: f64,
        scale: f64,
        shape: Shape,
        dtype: Option<DataType>,
        device: Option<Device>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        if scale < 0.0 {
            return Err(invalid_argument!(
                "normal scale must be non-negative, got {}",
                scale
            ));
        }
        let device = self.resolve_device(device);
        let params = OpParams::new()
            .set_float("loc", loc)
            .set_float("scale", scale)
            .set_shape("shape", shape)
            .set_dtype(dtype.unwrap_or(DataType::F32))
            .set_device(device);
        let tensor = self
            .inner
            .backend
            .invoke(op::RANDOM_NORMAL, &[], &params)?;
        self.wrap(tensor)
    }

    /// `n` draws from the categorical distribution whose unnormalized
    /// weights are the elements of `p_values`. Indices come back as I64.
    pub fn random_multinomial(
        &self,
        n: usize,
        p_values: &NdArray,
        shape: Option<Shape>,
    ) -> NdResult<NdArray> {
        self.ensure_open()?;
        if n == 0 {
            return Err(invalid_argument!("multinomial draw count must be positive"));
        }
        if p_values.is_released() {
            return Err(invalid_argument!(
                "probability array {} has already been released",
                p_values.id()
            ));
        }
        let device = self.resolve_device(Some(p_values.device()));
        let mut params = OpParams::new().set_int("n", n as i64).set_device(device);
        if let Some(shape) = shape {
            params = params.set_shape("shape", shape);
        }
        let tensor = self
            .inner
            .backend
            .invoke(op::RANDOM_MULTINOMIAL, &[p_values.handle()], &params)?;
        self.wrap(tensor)
    }

    /// Load every array stored at `path` into this scope.
    ///
    /// All-or-nothing: if adopting any loaded tensor fails, the ones
    /// already materialized are released before the error is returned.
    pub fn load(&self, path: &std::path::Path) -> NdResult<Vec<NdArray>> {
        self.ensure_open()?;
        let tensors = self.inner.backend.load(path)?;
        let mut arrays = Vec::with_capacity(tensors.len());
        let mut pending = tensors.into_iter();
        while let Some(tensor) = pending.next() {
            match self.wrap(tensor) {
                Ok(array) => arrays.push(array),
                Err(err) => {
                    for array in &arrays {
                        if let Err(close_err) = array.close() {
                            tracing::warn!(
                                array = %array.id(),
                                error = %close_err,
                                "failed to roll back partially loaded array"
                            );
                        }
                    }
                    for tensor in pending {
                        self.release_orphan(tensor.handle);
                    }
                    return Err(err);
                }
            }
        }
        Ok(arrays)
    }

    /// Persist the given arrays at `path`. Every array must still be live.
    pub fn save(&self, path: &std::path::Path, arrays: &[NdArray]) -> NdResult<()> {
        self.ensure_open()?;
        let mut tensors = Vec::with_capacity(arrays.len());
        for array in arrays {
            if array.is_released() {
                return Err(invalid_argument!(
                    "cannot save released array {}",
                    array.id()
                ));
            }
            tensors.push(array.to_native_tensor());
        }
        self.inner.backend.save(path, &tensors)
    }

    fn release_orphan(&self, handle: NativeHandle) {
        if let Err(err) = self.inner.backend.release(handle) {
            tracing::warn!(%handle, error = %err, "failed to release orphaned handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::runtime::{RuntimeConfig, ScopeRuntime};

    fn runtime() -> (ScopeRuntime, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::new());
        let runtime = ScopeRuntime::new(backend.clone(), RuntimeConfig::default());
        (runtime, backend)
    }

    #[test]
    fn test_create_on_closed_scope_fails_before_allocation() {
        let (runtime, backend) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        scope.close().unwrap();

        let err = scope
            .create(Shape::of(&[4]), DataType::F32, None)
            .unwrap_err();
        assert!(err.is_lifecycle_violation());
        assert_eq!(backend.alloc_count(), 0);
    }

    #[test]
    fn test_device_resolution_precedence() {
        let backend = Arc::new(HostBackend::new());
        let runtime = ScopeRuntime::new(
            backend,
            RuntimeConfig::default().with_default_device(Device::Gpu(0)),
        );

        // Scope inherits the runtime default
        let scope = runtime.new_scope(None).unwrap();
        let a = scope.create(Shape::of(&[1]), DataType::F32, None).unwrap();
        assert_eq!(a.device(), Device::Gpu(0));

        // Explicit argument wins over the scope device
        let b = scope
            .create(Shape::of(&[1]), DataType::F32, Some(Device::Cpu))
            .unwrap();
        assert_eq!(b.device(), Device::Cpu);
    }

    #[test]
    fn test_arange_rejects_zero_step() {
        let (runtime, backend) = runtime();
        let scope = runtime.new_scope(None).unwrap();

        let err = scope.arange(0.0, 10.0, 0.0, None, None).unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(backend.alloc_count(), 0);
    }

    #[test]
    fn test_arange_defaults_to_f32() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let array = scope.arange(0.0, 4.0, 1.0, None, None).unwrap();
        assert_eq!(array.dtype(), DataType::F32);
        assert_eq!(array.shape(), &Shape::of(&[4]));
    }

    #[test]
    fn test_linspace_is_always_f32() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let array = scope.linspace(0.0, 1.0, 10, true, None).unwrap();
        assert_eq!(array.dtype(), DataType::F32);
    }

    #[test]
    fn test_random_normal_rejects_negative_scale() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let err = scope
            .random_normal(0.0, -1.0, Shape::of(&[4]), None, None)
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_random_uniform_rejects_inverted_bounds() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let err = scope
            .random_uniform(2.0, 1.0, Shape::of(&[4]), None, None)
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_multinomial_rejects_zero_draws() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let p = scope
            .random_uniform(0.0, 1.0, Shape::of(&[3]), None, None)
            .unwrap();
        let err = scope.random_multinomial(0, &p, None).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_multinomial_rejects_released_probabilities() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let p = scope
            .random_uniform(0.0, 1.0, Shape::of(&[3]), None, None)
            .unwrap();
        p.close().unwrap();
        let err = scope.random_multinomial(5, &p, None).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_csr_owns_its_index_arrays() {
        let (runtime, backend) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let array = scope
            .create_csr(
                Shape::of(&[3, 4]),
                DataType::F32,
                &[0, 1, 2, 3],
                &[0, 2, 3],
                None,
            )
            .unwrap();
        assert_eq!(array.sparse_format(), SparseFormat::Csr);

        // data + indptr + indices
        assert_eq!(scope.resource_count(), 3);
        scope.close().unwrap();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_csr_requires_matrix_shape() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let err = scope
            .create_csr(Shape::of(&[4]), DataType::F32, &[0], &[], None)
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_row_sparse_rejects_excess_indices() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let err = scope
            .create_row_sparse(Shape::of(&[2, 4]), DataType::F32, &[0, 1, 2], None)
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_row_sparse_format() {
        let (runtime, _) = runtime();
        let scope = runtime.new_scope(None).unwrap();
        let array = scope
            .create_row_sparse(Shape::of(&[10, 4]), DataType::F32, &[1, 7], None)
            .unwrap();
        assert_eq!(array.sparse_format(), SparseFormat::RowSparse);
    }

    #[test]
    fn test_save_and_load_through_scope() {
        let (runtime, backend) = runtime();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arrays.nds");

        let writer = runtime.new_scope(None).unwrap();
        let a = writer.ones(Shape::of(&[2, 2]), DataType::F32, None).unwrap();
        let b = writer.arange(0.0, 3.0, 1.0, Some(DataType::I32), None).unwrap();
        writer.save(&path, &[a, b]).unwrap();
        writer.close().unwrap();

        let reader = runtime.new_scope(None).unwrap();
        let loaded = reader.load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].shape(), &Shape::of(&[2, 2]));
        assert_eq!(loaded[1].dtype(), DataType::I32);

        reader.close().unwrap();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_save_rejects_released_array() {
        let (runtime, _) = runtime();
        let dir = tempfile::tempdir().unwrap();
        let scope = runtime.new_scope(None).unwrap();
        let array = scope.ones(Shape::of(&[2]), DataType::F32, None).unwrap();
        array.close().unwrap();

        let err = scope
            .save(&dir.path().join("x.nds"), &[array])
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_allocation_on_root_is_untracked() {
        let (runtime, backend) = runtime();
        let root = runtime.root();
        let array = root.create(Shape::of(&[2]), DataType::F32, None).unwrap();

        assert_eq!(root.resource_count(), 0);
        root.close().unwrap();
        assert!(!array.is_released());

        array.close().unwrap();
        assert_eq!(backend.live_handles(), 0);
    }
}
