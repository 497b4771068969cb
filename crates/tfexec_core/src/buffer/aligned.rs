use std::sync::Arc;

use tfexec_error::Result;

use super::buffer_manager::{BufferManager, Reservation};

/// Size of a single slot. Every literal cell and every output value occupies
/// exactly one slot.
pub const SLOT_BYTES: usize = std::mem::size_of::<u64>();

/// Host allocation aligned to 8 bytes.
///
/// Backed by `u64`s so alignment comes for free. The allocation is rounded up
/// to a whole number of slots, `len` tracks the requested size in bytes.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: Vec<u64>,
    len: usize,
    _reservation: Reservation,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of at least `len` bytes.
    pub fn try_new_zeroed(manager: &Arc<dyn BufferManager>, len: usize) -> Result<Self> {
        let slots = len.div_ceil(SLOT_BYTES);
        let reservation = Reservation::try_new(manager, slots * SLOT_BYTES)?;

        Ok(AlignedBuffer {
            data: vec![0; slots],
            len,
            _reservation: reservation,
        })
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr().cast()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `data` holds at least `len` initialized bytes, and u8 has no
        // alignment requirement.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: See `as_bytes`.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    /// View the buffer as whole 8 byte slots.
    pub fn as_slots(&self) -> &[u64] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::buffer_manager::TrackedBufferManager;

    #[test]
    fn rounds_up_to_slots() {
        let tracked = Arc::new(TrackedBufferManager::default());
        let manager: Arc<dyn BufferManager> = tracked.clone();

        let buf = AlignedBuffer::try_new_zeroed(&manager, 3).unwrap();
        assert_eq!(3, buf.len());
        assert_eq!(1, buf.as_slots().len());
        assert_eq!(8, tracked.bytes_in_use());
        assert_eq!(0, buf.as_ptr() as usize % SLOT_BYTES);
        assert_eq!(&[0, 0, 0], buf.as_bytes());

        std::mem::drop(buf);
        assert_eq!(0, tracked.bytes_in_use());
    }
}
