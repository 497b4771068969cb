use std::collections::HashMap;

use parking_lot::Mutex;
use tfexec_error::{DbError, Result};

use crate::buffer::aligned::SLOT_BYTES;
use crate::device::allocator::DeviceAllocator;
use crate::device::{DeviceId, DevicePtr};

#[derive(Debug)]
struct HostAllocation {
    slots: Box<[u64]>,
    num_bytes: usize,
}

/// A simulated device whose memory lives on the host.
///
/// Device addresses are real host addresses, so kernels run on the host can
/// dereference them directly.
#[derive(Debug)]
pub struct HostBackedDeviceAllocator {
    device_id: DeviceId,
    /// Fail allocations once this many are live.
    max_allocations: Option<usize>,
    fail_sync: bool,
    allocations: Mutex<HashMap<u64, HostAllocation>>,
}

impl HostBackedDeviceAllocator {
    pub fn new(device_id: DeviceId) -> Self {
        HostBackedDeviceAllocator {
            device_id,
            max_allocations: None,
            fail_sync: false,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_allocations(mut self, max: usize) -> Self {
        self.max_allocations = Some(max);
        self
    }

    /// Make every `synchronize` call fail.
    pub fn with_sync_failure(mut self) -> Self {
        self.fail_sync = true;
        self
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Run `f` on the bytes `[addr, addr + len)` if they fall within a single
    /// live allocation.
    fn with_region<T>(
        &self,
        addr: DevicePtr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T> {
        let mut allocations = self.allocations.lock();
        for (base, alloc) in allocations.iter_mut() {
            let end = base + alloc.num_bytes as u64;
            if addr.0 >= *base && addr.0 + len as u64 <= end {
                let offset = (addr.0 - base) as usize;
                // SAFETY: The slots cover at least `num_bytes` bytes, and u8
                // has no alignment requirement.
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(
                        alloc.slots.as_mut_ptr().cast::<u8>(),
                        alloc.slots.len() * SLOT_BYTES,
                    )
                };
                return Ok(f(&mut bytes[offset..offset + len]));
            }
        }

        Err(DbError::new("Device access outside of any allocation")
            .with_field("addr", addr)
            .with_field("len", len))
    }
}

impl DeviceAllocator for HostBackedDeviceAllocator {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn alloc(&self, num_bytes: usize) -> Result<DevicePtr> {
        let mut allocations = self.allocations.lock();
        if let Some(max) = self.max_allocations
            && allocations.len() >= max
        {
            return Err(DbError::new("Out of device memory")
                .with_field("device_id", self.device_id)
                .with_field("num_bytes", num_bytes));
        }

        // Always hand out at least one slot so every address is unique.
        let num_slots = usize::max(num_bytes.div_ceil(SLOT_BYTES), 1);
        let mut slots = vec![0_u64; num_slots].into_boxed_slice();
        let ptr = DevicePtr(slots.as_mut_ptr() as usize as u64);
        allocations.insert(ptr.0, HostAllocation { slots, num_bytes });

        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        self.allocations.lock().remove(&ptr.0);
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.with_region(dst, src.len(), |region| region.copy_from_slice(src))
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.with_region(src, dst.len(), |region| dst.copy_from_slice(region))
    }

    fn synchronize(&self) -> Result<()> {
        if self.fail_sync {
            return Err(DbError::new("Simulated synchronize failure")
                .with_field("device_id", self.device_id));
        }
        Ok(())
    }
}
