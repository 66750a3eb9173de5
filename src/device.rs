//! Placement context for native allocations
//!
//! Every scope and every array carries a [`Device`] describing where its
//! native memory lives. The core never interprets the device beyond passing
//! it to the backend; resolution order for an unspecified device is
//! explicit value, then the scope's device, then the runtime default.

use std::fmt;

/// Opaque placement descriptor for a native allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory
    Cpu,
    /// Device memory on the GPU with the given ordinal
    Gpu(u32),
}

impl Device {
    /// Resolve an optional explicit device against a fallback.
    ///
    /// This is the single precedence rule used by every allocation entry
    /// point and by sub-scope creation: an explicit value always wins.
    pub fn default_if_none(explicit: Option<Device>, fallback: Device) -> Device {
        explicit.unwrap_or(fallback)
    }

    /// Whether this device refers to host memory
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu({})", id),
        }
    }
}
