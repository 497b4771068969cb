use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tfexec_error::{DbError, Result};

pub trait BufferManager: Debug + Sync + Send {
    /// Try to reserve some number of bytes.
    ///
    /// This should never error when attempting to reserve zero bytes.
    fn try_reserve(&self, size_bytes: usize) -> Result<()>;

    /// Release bytes previously reserved with `try_reserve`.
    fn release(&self, size_bytes: usize);
}

/// A memory reservation against a buffer manager.
///
/// The reserved bytes are given back to the manager on drop.
#[derive(Debug)]
pub struct Reservation {
    manager: Arc<dyn BufferManager>,
    /// Size in bytes of the memory reservation.
    size: usize,
}

impl Reservation {
    pub fn try_new(manager: &Arc<dyn BufferManager>, size: usize) -> Result<Self> {
        manager.try_reserve(size)?;
        Ok(Reservation {
            manager: manager.clone(),
            size,
        })
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.manager.release(self.size);
    }
}

/// Placeholder buffer manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopBufferManager;

impl BufferManager for NopBufferManager {
    fn try_reserve(&self, _size_bytes: usize) -> Result<()> {
        Ok(())
    }

    fn release(&self, _size_bytes: usize) {
        // Ok
    }
}

/// Buffer manager that tracks the number of bytes currently reserved, with an
/// optional upper limit.
#[derive(Debug, Default)]
pub struct TrackedBufferManager {
    in_use: AtomicUsize,
    limit: Option<usize>,
}

impl TrackedBufferManager {
    pub fn with_limit(limit: usize) -> Self {
        TrackedBufferManager {
            in_use: AtomicUsize::new(0),
            limit: Some(limit),
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl BufferManager for TrackedBufferManager {
    fn try_reserve(&self, size_bytes: usize) -> Result<()> {
        let prev = self.in_use.fetch_add(size_bytes, Ordering::SeqCst);
        if let Some(limit) = self.limit
            && prev + size_bytes > limit
        {
            self.in_use.fetch_sub(size_bytes, Ordering::SeqCst);
            return Err(DbError::new("Memory limit exceeded")
                .with_field("requested", size_bytes)
                .with_field("in_use", prev)
                .with_field("limit", limit));
        }
        Ok(())
    }

    fn release(&self, size_bytes: usize) {
        self.in_use.fetch_sub(size_bytes, Ordering::SeqCst);
    }
}
