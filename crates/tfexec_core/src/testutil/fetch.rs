use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tfexec_error::{DbError, Result};

use crate::buffer::aligned::SLOT_BYTES;
use crate::device::allocator::DeviceAllocator;
use crate::device::{DeviceId, DevicePtr, MemoryLevel};
use crate::execution_unit::FragmentInfo;
use crate::expr::ColumnExpr;
use crate::fetch::{ColumnFetcher, FetchedColumn};
use crate::literal::LiteralValue;

/// Densely packed column values.
#[derive(Debug)]
struct HostColumn {
    slots: Vec<u64>,
    num_bytes: usize,
    num_elements: usize,
}

impl HostColumn {
    fn from_values<T: LiteralValue>(values: &[T]) -> Self {
        let width = std::mem::size_of::<T>();
        let num_bytes = width * values.len();
        let mut slots = vec![0_u64; usize::max(num_bytes.div_ceil(SLOT_BYTES), 1)];

        // SAFETY: Viewing initialized u64s as bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                slots.as_mut_ptr().cast::<u8>(),
                slots.len() * SLOT_BYTES,
            )
        };
        for (chunk, value) in bytes.chunks_exact_mut(width).zip(values) {
            chunk.copy_from_slice(value.to_cell_bytes().as_ref());
        }

        HostColumn {
            slots,
            num_bytes,
            num_elements: values.len(),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: See `from_values`.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.slots.as_ptr().cast::<u8>(), self.slots.len() * SLOT_BYTES)
        };
        &bytes[..self.num_bytes]
    }
}

/// Frees a device copy of a column once the last handle is dropped.
#[derive(Debug)]
struct DeviceColumnGuard {
    allocator: Arc<dyn DeviceAllocator>,
    ptr: DevicePtr,
}

impl Drop for DeviceColumnGuard {
    fn drop(&mut self) {
        self.allocator.free(self.ptr);
    }
}

/// Column fetcher serving columns held in memory, keyed by column index.
///
/// Device fetches copy the column through the configured device allocator.
/// The copy is freed when the returned handle is dropped.
#[derive(Debug, Default)]
pub struct MemoryColumnFetcher {
    columns: HashMap<usize, Arc<HostColumn>>,
    device: Option<Arc<dyn DeviceAllocator>>,
    fetch_count: AtomicUsize,
}

impl MemoryColumnFetcher {
    pub fn with_column<T: LiteralValue>(mut self, column_idx: usize, values: &[T]) -> Self {
        self.columns
            .insert(column_idx, Arc::new(HostColumn::from_values(values)));
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceAllocator>) -> Self {
        self.device = Some(device);
        self
    }

    /// Number of successful fetches.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

impl ColumnFetcher for MemoryColumnFetcher {
    fn fetch_one_fragment(
        &self,
        column: &ColumnExpr,
        _fragment: &FragmentInfo,
        memory_level: MemoryLevel,
        device_id: DeviceId,
    ) -> Result<FetchedColumn> {
        let host = self.columns.get(&column.column_idx).ok_or_else(|| {
            DbError::new("Missing column").with_field("column", column)
        })?;

        let fetched = match memory_level {
            MemoryLevel::Host => FetchedColumn {
                ptr: host.slots.as_ptr().cast(),
                num_elements: host.num_elements,
                owner: host.clone(),
            },
            MemoryLevel::Device => {
                let allocator = self
                    .device
                    .as_ref()
                    .ok_or_else(|| DbError::new("Fetcher has no device"))?;
                if allocator.device_id() != device_id {
                    return Err(DbError::new("Fetcher device does not match requested device")
                        .with_field("requested", device_id)
                        .with_field("device", allocator.device_id()));
                }

                let ptr = allocator.alloc(usize::max(host.num_bytes, SLOT_BYTES))?;
                let guard = DeviceColumnGuard {
                    allocator: allocator.clone(),
                    ptr,
                };
                allocator.copy_to_device(ptr, host.as_bytes())?;

                FetchedColumn {
                    ptr: ptr.as_ptr(),
                    num_elements: host.num_elements,
                    owner: Arc::new(guard),
                }
            }
        };

        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        Ok(fetched)
    }
}
