//! Interface to the column fetcher that turns a column reference into a
//! contiguous buffer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tfexec_error::Result;

use crate::device::{DeviceId, MemoryLevel};
use crate::execution_unit::FragmentInfo;
use crate::expr::ColumnExpr;

/// A column buffer produced by a column fetcher.
///
/// The buffer is not owned by the dispatcher. `owner` keeps the underlying
/// chunk alive, and must be held for as long as `ptr` may be read.
pub struct FetchedColumn {
    /// Start of the buffer. Either a host pointer or a device address
    /// depending on the memory level it was fetched at.
    pub ptr: *const u8,
    /// Number of elements in the buffer.
    pub num_elements: usize,
    pub owner: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for FetchedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedColumn")
            .field("ptr", &self.ptr)
            .field("num_elements", &self.num_elements)
            .finish_non_exhaustive()
    }
}

pub trait ColumnFetcher: fmt::Debug {
    /// Fetch the buffer for a column in a single fragment, placed at the given
    /// memory level.
    ///
    /// Buffers may be shared with concurrent readers and must not be mutated.
    fn fetch_one_fragment(
        &self,
        column: &ColumnExpr,
        fragment: &FragmentInfo,
        memory_level: MemoryLevel,
        device_id: DeviceId,
    ) -> Result<FetchedColumn>;
}
