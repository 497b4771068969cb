use std::sync::Arc;

use tfexec_error::{DbError, Result};
use tracing::trace;

use crate::buffer::aligned::AlignedBuffer;
use crate::buffer::buffer_manager::BufferManager;
use crate::device::allocator::DeviceAllocator;
use crate::device::{DevicePtr, DeviceType, MemoryLevel};
use crate::fetch::FetchedColumn;

/// A single allocation tracked by an allocation context.
#[derive(Debug)]
pub enum Allocation {
    OwnedHost(AlignedBuffer),
    OwnedDevice { ptr: DevicePtr, num_bytes: usize },
    /// Column buffer owned by the column fetcher. Only the handle is held.
    Borrowed(FetchedColumn),
}

/// Owns every intermediate buffer for one table function invocation on one
/// device.
///
/// Owned device allocations are freed when the context is dropped, host
/// buffers release their reservations, and borrowed column handles are simply
/// dropped. This happens on every exit path, including errors.
#[derive(Debug)]
pub struct AllocationContext {
    device_type: DeviceType,
    buffer_manager: Arc<dyn BufferManager>,
    device_allocator: Option<Arc<dyn DeviceAllocator>>,
    allocations: Vec<Allocation>,
}

impl AllocationContext {
    pub fn new_host(buffer_manager: Arc<dyn BufferManager>) -> Self {
        AllocationContext {
            device_type: DeviceType::Cpu,
            buffer_manager,
            device_allocator: None,
            allocations: Vec::new(),
        }
    }

    pub fn new_device(
        buffer_manager: Arc<dyn BufferManager>,
        device_allocator: Arc<dyn DeviceAllocator>,
    ) -> Self {
        AllocationContext {
            device_type: DeviceType::Gpu,
            buffer_manager,
            device_allocator: Some(device_allocator),
            allocations: Vec::new(),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn memory_level(&self) -> MemoryLevel {
        self.device_type.memory_level()
    }

    pub fn buffer_manager(&self) -> &Arc<dyn BufferManager> {
        &self.buffer_manager
    }

    /// Get the device allocator.
    ///
    /// Errors if this context was not created for device execution.
    pub fn device_allocator(&self) -> Result<&Arc<dyn DeviceAllocator>> {
        self.device_allocator.as_ref().ok_or_else(|| {
            DbError::internal("Missing device allocator for device allocation")
                .with_field("device_type", self.device_type)
        })
    }

    /// Allocate a zeroed host buffer owned by this context.
    pub fn alloc_host(&mut self, num_bytes: usize) -> Result<&mut AlignedBuffer> {
        let buf = AlignedBuffer::try_new_zeroed(&self.buffer_manager, num_bytes)?;
        self.allocations.push(Allocation::OwnedHost(buf));
        match self.allocations.last_mut() {
            Some(Allocation::OwnedHost(buf)) => Ok(buf),
            _ => Err(DbError::internal("Expected host allocation")),
        }
    }

    /// Allocate device memory owned by this context.
    pub fn alloc_device(&mut self, num_bytes: usize) -> Result<DevicePtr> {
        let ptr = self.device_allocator()?.alloc(num_bytes)?;
        trace!(%ptr, num_bytes, "allocated device buffer");
        self.allocations
            .push(Allocation::OwnedDevice { ptr, num_bytes });
        Ok(ptr)
    }

    /// Allocate device memory and copy `bytes` into the front of it.
    pub fn alloc_device_with(&mut self, num_bytes: usize, bytes: &[u8]) -> Result<DevicePtr> {
        if bytes.len() > num_bytes {
            return Err(DbError::internal("Copy larger than device allocation")
                .with_field("copy_bytes", bytes.len())
                .with_field("alloc_bytes", num_bytes));
        }
        let ptr = self.alloc_device(num_bytes)?;
        self.device_allocator()?.copy_to_device(ptr, bytes)?;
        Ok(ptr)
    }

    /// Hold onto a fetched column for the life of this context, returning the
    /// buffer pointer.
    pub fn borrow_column(&mut self, column: FetchedColumn) -> *const u8 {
        let ptr = column.ptr;
        self.allocations.push(Allocation::Borrowed(column));
        ptr
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }
}

impl Drop for AllocationContext {
    fn drop(&mut self) {
        for alloc in self.allocations.drain(..) {
            if let Allocation::OwnedDevice { ptr, num_bytes } = alloc {
                // Device contexts always have an allocator.
                if let Some(allocator) = &self.device_allocator {
                    trace!(%ptr, num_bytes, "freeing device buffer");
                    allocator.free(ptr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tfexec_error::ErrorKind;

    use super::*;
    use crate::buffer::buffer_manager::{NopBufferManager, TrackedBufferManager};
    use crate::testutil::device::HostBackedDeviceAllocator;

    #[test]
    fn host_allocations_released_on_drop() {
        let tracked = Arc::new(TrackedBufferManager::default());
        let mut ctx = AllocationContext::new_host(tracked.clone());

        let buf = ctx.alloc_host(8).unwrap();
        buf.as_bytes_mut()[0] = 4;
        assert_eq!(8, tracked.bytes_in_use());

        std::mem::drop(ctx);
        assert_eq!(0, tracked.bytes_in_use());
    }

    #[test]
    fn host_context_has_no_device_allocator() {
        let mut ctx = AllocationContext::new_host(Arc::new(NopBufferManager));
        assert_eq!(ErrorKind::Internal, ctx.device_allocator().unwrap_err().kind());
        assert_eq!(ErrorKind::Internal, ctx.alloc_device(8).unwrap_err().kind());
    }

    #[test]
    fn device_allocations_freed_on_drop() {
        let device = Arc::new(HostBackedDeviceAllocator::new(0));
        let mut ctx = AllocationContext::new_device(Arc::new(NopBufferManager), device.clone());

        let ptr = ctx.alloc_device_with(8, &5_i64.to_ne_bytes()).unwrap();
        ctx.alloc_device(16).unwrap();
        assert_eq!(2, device.live_allocations());

        let mut out = [0; 8];
        device.copy_from_device(&mut out, ptr).unwrap();
        assert_eq!(5, i64::from_ne_bytes(out));

        std::mem::drop(ctx);
        assert_eq!(0, device.live_allocations());
    }

    #[test]
    fn copy_larger_than_allocation() {
        let device = Arc::new(HostBackedDeviceAllocator::new(0));
        let mut ctx = AllocationContext::new_device(Arc::new(NopBufferManager), device.clone());

        ctx.alloc_device_with(4, &[0; 8]).unwrap_err();
        assert_eq!(0, ctx.allocations().len());
    }
}
