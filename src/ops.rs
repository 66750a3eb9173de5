//! Operator parameter encoding for generator entry points
//!
//! Fill, range and random entry points do not allocate directly; they ask
//! the backend to run a named generator operator. [`OpParams`] is the
//! pairlist that carries the operator's arguments across the backend
//! boundary without the core interpreting them.

use crate::device::Device;
use crate::error::{NdResult, NdScopeError};
use crate::tensor::{DataType, Shape};

/// Names of the generator operators every backend is expected to serve.
pub mod op {
    pub const ZEROS: &str = "zeros";
    pub const ONES: &str = "ones";
    pub const ARANGE: &str = "arange";
    pub const EYE: &str = "eye";
    pub const LINSPACE: &str = "linspace";
    pub const RANDOM_UNIFORM: &str = "random_uniform";
    pub const RANDOM_NORMAL: &str = "random_normal";
    pub const RANDOM_MULTINOMIAL: &str = "random_multinomial";
}

/// A single operator argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Integer argument
    Int(i64),
    /// Floating-point argument
    Float(f64),
    /// Boolean argument
    Bool(bool),
    /// Shape argument
    Shape(Shape),
}

/// Ordered name/value pairs plus the dtype and device slots every
/// operator invocation carries.
#[derive(Debug, Clone, Default)]
pub struct OpParams {
    entries: Vec<(String, ParamValue)>,
    dtype: Option<DataType>,
    device: Option<Device>,
}

impl OpParams {
    /// Create an empty parameter list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an integer argument
    pub fn set_int(mut self, name: &str, value: i64) -> Self {
        self.entries.push((name.to_string(), ParamValue::Int(value)));
        self
    }

    /// Add a floating-point argument
    pub fn set_float(mut self, name: &str, value: f64) -> Self {
        self.entries
            .push((name.to_string(), ParamValue::Float(value)));
        self
    }

    /// Add a boolean argument
    pub fn set_bool(mut self, name: &str, value: bool) -> Self {
        self.entries
            .push((name.to_string(), ParamValue::Bool(value)));
        self
    }

    /// Add a shape argument
    pub fn set_shape(mut self, name: &str, value: Shape) -> Self {
        self.entries
            .push((name.to_string(), ParamValue::Shape(value)));
        self
    }

    /// Set the output datatype
    pub fn set_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Set the placement device
    pub fn set_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Look up an argument by name (last write wins)
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Integer argument accessor
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Float argument accessor (accepts integer arguments too)
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean argument accessor
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Shape argument accessor
    pub fn shape(&self, name: &str) -> Option<&Shape> {
        match self.get(name) {
            Some(ParamValue::Shape(v)) => Some(v),
            _ => None,
        }
    }

    /// Output datatype, if set
    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    /// Placement device, if set
    pub fn device(&self) -> Option<Device> {
        self.device
    }

    /// Integer argument that the operator cannot run without
    pub fn require_int(&self, name: &str) -> NdResult<i64> {
        self.int(name)
            .ok_or_else(|| missing_argument(name))
    }

    /// Float argument that the operator cannot run without
    pub fn require_float(&self, name: &str) -> NdResult<f64> {
        self.float(name)
            .ok_or_else(|| missing_argument(name))
    }

    /// Shape argument that the operator cannot run without
    pub fn require_shape(&self, name: &str) -> NdResult<&Shape> {
        self.shape(name)
            .ok_or_else(|| missing_argument(name))
    }

    /// Output datatype that the operator cannot run without
    pub fn require_dtype(&self) -> NdResult<DataType> {
        self.dtype.ok_or_else(|| missing_argument("dtype"))
    }

    /// Placement device that the operator cannot run without
    pub fn require_device(&self) -> NdResult<Device> {
        self.device.ok_or_else(|| missing_argument("device"))
    }
}

fn missing_argument(name: &str) -> NdScopeError {
    NdScopeError::InvalidArgument(format!("missing required argument '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let params = OpParams::new()
            .set_int("start", 3)
            .set_float("stop", 9.5)
            .set_bool("endpoint", true)
            .set_shape("shape", Shape::of(&[2, 2]))
            .set_dtype(DataType::F32)
            .set_device(Device::Gpu(0));

        assert_eq!(params.int("start"), Some(3));
        assert_eq!(params.float("stop"), Some(9.5));
        assert_eq!(params.bool("endpoint"), Some(true));
        assert_eq!(params.shape("shape"), Some(&Shape::of(&[2, 2])));
        assert_eq!(params.dtype(), Some(DataType::F32));
        assert_eq!(params.device(), Some(Device::Gpu(0)));
    }

    #[test]
    fn test_int_promotes_to_float() {
        let params = OpParams::new().set_int("n", 4);
        assert_eq!(params.float("n"), Some(4.0));
    }

    #[test]
    fn test_last_write_wins() {
        let params = OpParams::new().set_int("k", 1).set_int("k", 2);
        assert_eq!(params.int("k"), Some(2));
    }

    #[test]
    fn test_require_reports_missing_argument() {
        let params = OpParams::new();
        let err = params.require_int("num").unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("num"));
    }
}
