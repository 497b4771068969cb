use std::fmt::Debug;

use tfexec_error::Result;

use super::{DeviceId, DevicePtr};

/// Allocates and moves memory on a single device.
pub trait DeviceAllocator: Debug + Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Allocate `num_bytes` of device memory.
    ///
    /// Contents of the allocation are unspecified.
    fn alloc(&self, num_bytes: usize) -> Result<DevicePtr>;

    /// Free an allocation previously returned by `alloc`.
    fn free(&self, ptr: DevicePtr);

    /// Copy host bytes to device memory starting at `dst`.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy device memory starting at `src` into the host slice.
    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Block until all outstanding work on the device has completed.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
