//! Device selection and device memory.

pub mod allocator;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a single device.
pub type DeviceId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl DeviceType {
    /// Memory level that buffers handed to a kernel on this device must live
    /// in.
    pub const fn memory_level(&self) -> MemoryLevel {
        match self {
            DeviceType::Cpu => MemoryLevel::Host,
            DeviceType::Gpu => MemoryLevel::Device,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
        }
    }
}

/// Where a buffer resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLevel {
    Host,
    Device,
}

/// Opaque address in device memory.
///
/// Zero is the null address. Transparent over `u64` so a pointer can be
/// handed to a kernel launch as a single device-address-sized cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Offset this address by some number of bytes.
    pub const fn byte_add(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    /// Reinterpret the device address as a pointer.
    ///
    /// The pointer may only be dereferenced on the device.
    pub fn as_ptr(self) -> *const u8 {
        self.0 as usize as *const u8
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Grid and block shape for a kernel launch.
///
/// Only the x dimension is configurable, y and z are always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDims {
    pub grid_size_x: u32,
    pub block_size_x: u32,
}

impl LaunchDims {
    pub const fn grid(&self) -> [u32; 3] {
        [self.grid_size_x, 1, 1]
    }

    pub const fn block(&self) -> [u32; 3] {
        [self.block_size_x, 1, 1]
    }

    /// Total number of device threads for a launch.
    pub const fn num_threads(&self) -> u64 {
        self.grid_size_x as u64 * self.block_size_x as u64
    }
}

impl Default for LaunchDims {
    fn default() -> Self {
        LaunchDims {
            grid_size_x: 1,
            block_size_x: 1,
        }
    }
}
