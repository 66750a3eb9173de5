//! In-process reference backend
//!
//! [`HostBackend`] implements the allocation gateway against plain host
//! memory. It exists so the scope tree can be exercised without any real
//! device: the test suite, the benchmarks and the doc examples all run on
//! it.
//!
//! For lifetime tests it tracks live handles and counts every allocate and
//! release, and it can be told to fail the release of specific handles to
//! simulate an already-foreign-released or misbehaving native buffer.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::backend::{NativeBackend, NativeHandle, NativeTensor};
use crate::device::Device;
use crate::error::{NdResult, NdScopeError};
use crate::ops::{op, OpParams};
use crate::tensor::{DataType, Shape, SparseFormat};

const MAGIC: &[u8; 4] = b"NDSC";

#[derive(Debug)]
struct HostBuffer {
    bytes: Vec<u8>,
    dtype: DataType,
    shape: Shape,
    device: Device,
    format: SparseFormat,
}

#[derive(Debug, Default)]
struct HostState {
    next_handle: u64,
    buffers: HashMap<u64, HostBuffer>,
    fail_release: HashSet<u64>,
    alloc_count: u64,
    release_count: u64,
}

/// Host-memory reference implementation of [`NativeBackend`].
#[derive(Debug, Default)]
pub struct HostBackend {
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles currently allocated and not released
    pub fn live_handles(&self) -> usize {
        self.state.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    /// Total number of successful allocations
    pub fn alloc_count(&self) -> u64 {
        self.state.lock().map(|s| s.alloc_count).unwrap_or(0)
    }

    /// Total number of successful releases
    pub fn release_count(&self) -> u64 {
        self.state.lock().map(|s| s.release_count).unwrap_or(0)
    }

    /// Whether the given handle is still live
    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.state
            .lock()
            .map(|s| s.buffers.contains_key(&handle.0))
            .unwrap_or(false)
    }

    /// Make the next release of `handle` fail with a `ReleaseFailed` error.
    ///
    /// The buffer stays live, simulating a native free that reported an
    /// error. Used by cascade tests.
    pub fn fail_release_of(&self, handle: NativeHandle) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_release.insert(handle.0);
        }
    }

    /// Raw bytes of a live buffer, for assertions in tests
    pub fn buffer_bytes(&self, handle: NativeHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()?
            .buffers
            .get(&handle.0)
            .map(|b| b.bytes.clone())
    }

    fn insert(
        &self,
        bytes: Vec<u8>,
        dtype: DataType,
        shape: Shape,
        device: Device,
        format: SparseFormat,
    ) -> NdResult<NativeHandle> {
        let mut state = self.state.lock()?;
        state.next_handle += 1;
        let handle = NativeHandle(state.next_handle);
        state.buffers.insert(
            handle.0,
            HostBuffer {
                bytes,
                dtype,
                shape,
                device,
                format,
            },
        );
        state.alloc_count += 1;
        tracing::trace!(%handle, "host backend allocated buffer");
        Ok(handle)
    }

    fn generate(&self, op_name: &str, params: &OpParams) -> NdResult<NativeTensor> {
        let device = params.require_device()?;
        match op_name {
            op::ZEROS | op::ONES => {
                let dtype = params.require_dtype()?;
                let shape = params.require_shape("shape")?.clone();
                let value = if op_name == op::ONES { 1.0 } else { 0.0 };
                let count = shape.element_count()?;
                let bytes = encode_values(dtype, &vec![value; count])?;
                let handle = self.insert(bytes, dtype, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, dtype, shape, device))
            }
            op::ARANGE => {
                let dtype = params.require_dtype()?;
                let start = params.require_float("start")?;
                let stop = params.require_float("stop")?;
                let step = params.require_float("step")?;
                let count = if (stop - start) / step > 0.0 {
                    ((stop - start) / step).ceil() as usize
                } else {
                    0
                };
                let values: Vec<f64> = (0..count).map(|i| start + i as f64 * step).collect();
                let shape = Shape::of(&[count]);
                let bytes = encode_values(dtype, &values)?;
                let handle = self.insert(bytes, dtype, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, dtype, shape, device))
            }
            op::EYE => {
                let dtype = params.require_dtype()?;
                let rows = params.require_int("rows")? as usize;
                let cols = params.require_int("cols")? as usize;
                let k = params.int("k").unwrap_or(0);
                let mut values = vec![0.0; rows.saturating_mul(cols)];
                for r in 0..rows {
                    let c = r as i64 + k;
                    if c >= 0 && (c as usize) < cols {
                        values[r * cols + c as usize] = 1.0;
                    }
                }
                let shape = Shape::of(&[rows, cols]);
                let bytes = encode_values(dtype, &values)?;
                let handle = self.insert(bytes, dtype, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, dtype, shape, device))
            }
            op::LINSPACE => {
                // Always F32, matching the operator contract
                let start = params.require_float("start")?;
                let stop = params.require_float("stop")?;
                let num = params.require_int("num")? as usize;
                let endpoint = params.bool("endpoint").unwrap_or(true);
                let divisor = if endpoint { num.saturating_sub(1) } else { num };
                let step = if divisor > 0 {
                    (stop - start) / divisor as f64
                } else {
                    0.0
                };
                let values: Vec<f64> = (0..num).map(|i| start + i as f64 * step).collect();
                let shape = Shape::of(&[num]);
                let bytes = encode_values(DataType::F32, &values)?;
                let handle =
                    self.insert(bytes, DataType::F32, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, DataType::F32, shape, device))
            }
            op::RANDOM_UNIFORM => {
                let dtype = params.require_dtype()?;
                let low = params.require_float("low")?;
                let high = params.require_float("high")?;
                let shape = params.require_shape("shape")?.clone();
                let count = shape.element_count()?;
                let mut rng = rand::thread_rng();
                let values: Vec<f64> =
                    (0..count).map(|_| rng.gen::<f64>() * (high - low) + low).collect();
                let bytes = encode_values(dtype, &values)?;
                let handle = self.insert(bytes, dtype, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, dtype, shape, device))
            }
            op::RANDOM_NORMAL => {
                let dtype = params.require_dtype()?;
                let loc = params.require_float("loc")?;
                let scale = params.require_float("scale")?;
                let shape = params.require_shape("shape")?.clone();
                let count = shape.element_count()?;
                let mut rng = rand::thread_rng();
                let values: Vec<f64> = (0..count)
                    .map(|_| loc + scale * sample_standard_normal(&mut rng))
                    .collect();
                let bytes = encode_values(dtype, &values)?;
                let handle = self.insert(bytes, dtype, shape.clone(), device, SparseFormat::Dense)?;
                Ok(NativeTensor::dense(handle, dtype, shape, device))
            }
            other => Err(NdScopeError::UnknownOperator(other.to_string())),
        }
    }

    fn multinomial(
        &self,
        inputs: &[NativeHandle],
        params: &OpParams,
    ) -> NdResult<NativeTensor> {
        let device = params.require_device()?;
        let n = params.require_int("n")? as usize;
        let p_handle = inputs.first().ok_or_else(|| {
            NdScopeError::InvalidArgument("random_multinomial requires a probability input".into())
        })?;

        let weights = {
            let state = self.state.lock()?;
            let buffer = state.buffers.get(&p_handle.0).ok_or_else(|| {
                NdScopeError::AllocationFailed(format!("unknown input handle {}", p_handle))
            })?;
            decode_values(buffer.dtype, &buffer.bytes)?
        };
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(NdScopeError::InvalidArgument(
                "probability weights must sum to a positive value".into(),
            ));
        }

        let mut rng = rand::thread_rng();
        let values: Vec<f64> = (0..n)
            .map(|_| {
                let mut target = rng.gen::<f64>() * total;
                for (i, w) in weights.iter().enumerate() {
                    target -= w;
                    if target <= 0.0 {
                        return i as f64;
                    }
                }
                (weights.len() - 1) as f64
            })
            .collect();

        let shape = params
            .shape("shape")
            .cloned()
            .unwrap_or_else(|| Shape::of(&[n]));
        let bytes = encode_values(DataType::I64, &values)?;
        let handle = self.insert(bytes, DataType::I64, shape.clone(), device, SparseFormat::Dense)?;
        Ok(NativeTensor::dense(handle, DataType::I64, shape, device))
    }
}

impl NativeBackend for HostBackend {
    fn allocate(&self, shape: &Shape, dtype: DataType, device: &Device) -> NdResult<NativeHandle> {
        let size = shape.size_in_bytes(dtype.size_in_bytes())?;
        self.insert(
            vec![0u8; size],
            dtype,
            shape.clone(),
            *device,
            SparseFormat::Dense,
        )
    }

    fn allocate_sparse(
        &self,
        format: SparseFormat,
        shape: &Shape,
        dtype: DataType,
        device: &Device,
        aux_handles: &[NativeHandle],
    ) -> NdResult<NativeHandle> {
        {
            let state = self.state.lock()?;
            for aux in aux_handles {
                if !state.buffers.contains_key(&aux.0) {
                    return Err(NdScopeError::AllocationFailed(format!(
                        "sparse auxiliary handle {} is not live",
                        aux
                    )));
                }
            }
        }
        // Physical layout is this backend's business; it stores nothing
        // until data is bound to the sparse buffer.
        self.insert(Vec::new(), dtype, shape.clone(), *device, format)
    }

    fn invoke(
        &self,
        op_name: &str,
        inputs: &[NativeHandle],
        params: &OpParams,
    ) -> NdResult<NativeTensor> {
        if op_name == op::RANDOM_MULTINOMIAL {
            self.multinomial(inputs, params)
        } else {
            self.generate(op_name, params)
        }
    }

    fn upload(&self, handle: NativeHandle, bytes: &[u8]) -> NdResult<()> {
        let mut state = self.state.lock()?;
        let buffer = state.buffers.get_mut(&handle.0).ok_or_else(|| {
            NdScopeError::AllocationFailed(format!("upload to unknown handle {}", handle))
        })?;
        if bytes.len() > buffer.bytes.len() {
            return Err(NdScopeError::InvalidArgument(format!(
                "upload of {} bytes exceeds buffer of {} bytes",
                bytes.len(),
                buffer.bytes.len()
            )));
        }
        buffer.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn release(&self, handle: NativeHandle) -> NdResult<()> {
        let mut state = self.state.lock()?;
        if state.fail_release.remove(&handle.0) {
            // Injected failure: the buffer stays live, as a native free
            // reporting an error would leave it.
            return Err(NdScopeError::ReleaseFailed(format!(
                "injected release failure for handle {}",
                handle
            )));
        }
        if state.buffers.remove(&handle.0).is_none() {
            return Err(NdScopeError::ReleaseFailed(format!(
                "handle {} is not live (double free?)",
                handle
            )));
        }
        state.release_count += 1;
        tracing::trace!(%handle, "host backend released buffer");
        Ok(())
    }

    fn load(&self, path: &Path) -> NdResult<Vec<NativeTensor>> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(NdScopeError::LoadFailed(format!(
                "{}: bad magic",
                path.display()
            )));
        }

        let count = reader.read_u32::<LittleEndian>()?;
        let mut tensors = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let dtype = DataType::from_tag(reader.read_u8()?).ok_or_else(|| {
                NdScopeError::LoadFailed(format!("{}: unknown dtype tag", path.display()))
            })?;
            let format = SparseFormat::from_tag(reader.read_u8()?).ok_or_else(|| {
                NdScopeError::LoadFailed(format!("{}: unknown format tag", path.display()))
            })?;
            let device = match reader.read_u8()? {
                0 => Device::Cpu,
                1 => Device::Gpu(reader.read_u32::<LittleEndian>()?),
                _ => {
                    return Err(NdScopeError::LoadFailed(format!(
                        "{}: unknown device tag",
                        path.display()
                    )))
                }
            };
            let rank = reader.read_u32::<LittleEndian>()? as usize;
            let mut dims = Vec::with_capacity(rank);
            for _ in 0..rank {
                dims.push(reader.read_u64::<LittleEndian>()? as usize);
            }
            let len = reader.read_u64::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;

            let shape = Shape::new(dims);
            let handle = self.insert(bytes, dtype, shape.clone(), device, format)?;
            tensors.push(NativeTensor {
                handle,
                dtype,
                shape,
                device,
                format,
            });
        }
        Ok(tensors)
    }

    fn save(&self, path: &Path, tensors: &[NativeTensor]) -> NdResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(tensors.len() as u32)?;

        let state = self.state.lock()?;
        for tensor in tensors {
            let buffer = state.buffers.get(&tensor.handle.0).ok_or_else(|| {
                NdScopeError::SaveFailed(format!("handle {} is not live", tensor.handle))
            })?;
            writer.write_u8(tensor.dtype.tag())?;
            writer.write_u8(tensor.format.tag())?;
            match tensor.device {
                Device::Cpu => writer.write_u8(0)?,
                Device::Gpu(id) => {
                    writer.write_u8(1)?;
                    writer.write_u32::<LittleEndian>(id)?;
                }
            }
            writer.write_u32::<LittleEndian>(tensor.shape.rank() as u32)?;
            for &d in tensor.shape.dims() {
                writer.write_u64::<LittleEndian>(d as u64)?;
            }
            writer.write_u64::<LittleEndian>(buffer.bytes.len() as u64)?;
            writer.write_all(&buffer.bytes)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One draw from the standard normal distribution (Box-Muller).
fn sample_standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn encode_values(dtype: DataType, values: &[f64]) -> NdResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.size_in_bytes());
    for &v in values {
        match dtype {
            DataType::F32 => bytes.write_f32::<LittleEndian>(v as f32)?,
            DataType::F64 => bytes.write_f64::<LittleEndian>(v)?,
            DataType::F16 => {
                bytes.write_u16::<LittleEndian>(half::f16::from_f64(v).to_bits())?
            }
            DataType::U8 => bytes.write_u8(v as u8)?,
            DataType::I32 => bytes.write_i32::<LittleEndian>(v as i32)?,
            DataType::I64 => bytes.write_i64::<LittleEndian>(v as i64)?,
        }
    }
    Ok(bytes)
}

fn decode_values(dtype: DataType, bytes: &[u8]) -> NdResult<Vec<f64>> {
    let size = dtype.size_in_bytes();
    let mut cursor = bytes;
    let mut values = Vec::with_capacity(bytes.len() / size);
    while cursor.len() >= size {
        let v = match dtype {
            DataType::F32 => cursor.read_f32::<LittleEndian>()? as f64,
            DataType::F64 => cursor.read_f64::<LittleEndian>()?,
            DataType::F16 => half::f16::from_bits(cursor.read_u16::<LittleEndian>()?).to_f64(),
            DataType::U8 => cursor.read_u8()? as f64,
            DataType::I32 => cursor.read_i32::<LittleEndian>()? as f64,
            DataType::I64 => cursor.read_i64::<LittleEndian>()? as f64,
        };
        values.push(v);
    }
    Ok(values)
}
