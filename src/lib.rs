//! ndscope - Scoped lifetime management for natively-allocated ND arrays
//!
//! Native array buffers live outside normal automatic reclamation: they must
//! be freed explicitly and exactly once, or the process eventually exhausts
//! native memory. This crate provides a tree of explicit scopes ([`NdScope`])
//! that own every array allocated under them and release the whole sub-tree
//! deterministically on [`NdScope::close`].
//!
//! The actual allocation and release of native memory is delegated to a
//! [`NativeBackend`] collaborator. The crate ships [`HostBackend`], an
//! in-process reference backend used by the test suite and benchmarks.
//!
//! ```
//! use ndscope::{DataType, HostBackend, RuntimeConfig, ScopeRuntime, Shape};
//! use std::sync::Arc;
//!
//! # fn main() -> ndscope::NdResult<()> {
//! let runtime = ScopeRuntime::new(Arc::new(HostBackend::new()), RuntimeConfig::default());
//! let scope = runtime.new_scope(None)?;
//! let weights = scope.zeros(Shape::of(&[64, 64]), DataType::F32, None)?;
//! assert!(!weights.is_released());
//! scope.close()?;
//! assert!(weights.is_released());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod logging;
pub mod ops;
pub mod runtime;
pub mod scope;
pub mod tensor;

pub use backend::{HostBackend, NativeBackend, NativeHandle, NativeTensor};
pub use device::Device;
pub use error::{ErrorCategory, NdResult, NdScopeError};
pub use ops::OpParams;
pub use runtime::{RuntimeConfig, ScopeRuntime};
pub use scope::{NdArray, NdScope, ResourceId};
pub use tensor::{DataType, Shape, SparseFormat};
