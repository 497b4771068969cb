use tfexec_error::{DbError, Result};

use crate::arrays::datatype::DataType;
use crate::buffer::aligned::{AlignedBuffer, SLOT_BYTES};

/// Columnar result of a table function.
///
/// Storage is a single column-major region with `capacity` 8 byte slots per
/// column. Only the first `entry_count` slots of each column are part of the
/// result.
#[derive(Debug)]
pub struct ResultSet {
    column_types: Vec<DataType>,
    storage: AlignedBuffer,
    capacity: usize,
    entry_count: usize,
}

impl ResultSet {
    /// Create a result set over already allocated storage.
    ///
    /// The entry count starts out at the full capacity.
    pub fn try_new(
        column_types: Vec<DataType>,
        storage: AlignedBuffer,
        capacity: usize,
    ) -> Result<Self> {
        let needed = column_types.len() * capacity;
        if storage.as_slots().len() < needed {
            return Err(DbError::internal("Result storage too small")
                .with_field("slots", storage.as_slots().len())
                .with_field("needed", needed));
        }

        Ok(ResultSet {
            column_types,
            storage,
            capacity,
            entry_count: capacity,
        })
    }

    pub fn column_types(&self) -> &[DataType] {
        &self.column_types
    }

    pub fn num_columns(&self) -> usize {
        self.column_types.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Set the number of rows actually produced.
    ///
    /// Errors if the count is larger than the allocated capacity, meaning the
    /// kernel wrote past the end of the output buffers.
    pub fn update_storage_entry_count(&mut self, entry_count: usize) -> Result<()> {
        if entry_count > self.capacity {
            return Err(DbError::contract_violation(
                "Table function output row count exceeds allocated capacity",
            )
            .with_field("row_count", entry_count)
            .with_field("capacity", self.capacity));
        }
        self.entry_count = entry_count;
        Ok(())
    }

    /// Byte offset of a column within the storage region.
    pub(crate) fn column_byte_offset(&self, idx: usize) -> usize {
        idx * self.capacity * SLOT_BYTES
    }

    /// Total bytes of storage covered by the columns.
    pub(crate) fn storage_bytes(&self) -> usize {
        self.column_types.len() * self.capacity * SLOT_BYTES
    }

    pub(crate) fn storage_mut(&mut self) -> &mut AlignedBuffer {
        &mut self.storage
    }

    /// Pointers to the start of each column's slots.
    pub(crate) fn column_ptrs_mut(&mut self) -> Vec<*mut u8> {
        let offsets: Vec<_> = (0..self.num_columns())
            .map(|idx| self.column_byte_offset(idx))
            .collect();
        let base = self.storage.as_mut_ptr();
        offsets
            .into_iter()
            // SAFETY: Offsets are within the storage, checked on create.
            .map(|offset| unsafe { base.add(offset) })
            .collect()
    }

    /// Get the raw slots for a column, limited to the entry count.
    pub fn column_slots(&self, idx: usize) -> Result<&[u64]> {
        let start = self.check_idx(idx)? * self.capacity;
        Ok(&self.storage.as_slots()[start..start + self.entry_count])
    }

    /// Read an integer column, each slot holding a 64-bit value.
    pub fn column_i64(&self, idx: usize) -> Result<Vec<i64>> {
        let datatype = &self.column_types[self.check_idx(idx)?];
        if !datatype.is_integer() {
            return Err(DbError::new(format!("Cannot read {datatype} column as integers")));
        }
        Ok(self
            .column_slots(idx)?
            .iter()
            .map(|&slot| slot as i64)
            .collect())
    }

    /// Read a float column.
    ///
    /// Float32 values are read from the low-address 4 bytes of each slot.
    pub fn column_f64(&self, idx: usize) -> Result<Vec<f64>> {
        let slots = self.column_slots(idx)?;
        match &self.column_types[idx] {
            DataType::Float64 => Ok(slots.iter().map(|&slot| f64::from_bits(slot)).collect()),
            DataType::Float32 => Ok(slots
                .iter()
                .map(|slot| {
                    let bytes = slot.to_ne_bytes();
                    f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
                })
                .collect()),
            other => Err(DbError::new(format!("Cannot read {other} column as floats"))),
        }
    }

    fn check_idx(&self, idx: usize) -> Result<usize> {
        if idx >= self.num_columns() {
            return Err(DbError::new("Column index out of bounds")
                .with_field("idx", idx)
                .with_field("num_columns", self.num_columns()));
        }
        Ok(idx)
    }
}
