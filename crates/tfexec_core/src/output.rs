//! Speculative output sizing and output buffer allocation.

use std::fmt::Debug;

use tfexec_error::{DbError, OptionExt, Result, not_implemented};
use tracing::{debug, trace};

use crate::allocation::AllocationContext;
use crate::buffer::aligned::{AlignedBuffer, SLOT_BYTES};
use crate::device::allocator::DeviceAllocator;
use crate::device::{DeviceId, DevicePtr, DeviceType, LaunchDims};
use crate::execution_unit::{OutputRowSizing, TableFunctionExecutionUnit};
use crate::result::ResultSet;

/// Compute the number of rows to allocate output storage for.
///
/// The input row count is scaled by the row multiplier and rounded up. The
/// product is computed exactly over the multiplier's binary value, so no
/// precision is lost for large row counts and a multiplier of at least 1 never
/// yields fewer rows than the input.
///
/// A product exceeding a whole number by no more than the multiplier's own
/// rounding error is taken to be that whole number. `10 * 1.1` therefore
/// allocates 11 rows, not 12. This only applies while that error is below half
/// a row.
pub fn output_row_capacity(
    unit: &TableFunctionExecutionUnit,
    input_row_count: usize,
) -> Result<usize> {
    match unit.output_row_sizing {
        Some(OutputRowSizing::RowMultiplier(multiplier)) => {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(
                    DbError::config("Row multiplier must be a positive, finite number")
                        .with_field("function", &unit.name)
                        .with_field("multiplier", multiplier),
                );
            }

            scale_row_count(input_row_count, multiplier).ok_or_else(|| {
                DbError::config("Output row capacity too large")
                    .with_field("input_row_count", input_row_count)
                    .with_field("multiplier", multiplier)
            })
        }
        None => Err(DbError::config(
            "Only row multiplier output buffer configuration is supported for table functions.",
        )
        .with_field("function", &unit.name)),
    }
}

/// Computes `ceil(n * multiplier)` for a positive, finite multiplier.
///
/// Returns `None` if the result doesn't fit in a `usize`.
fn scale_row_count(n: usize, multiplier: f64) -> Option<usize> {
    let bits = multiplier.to_bits();
    let biased_exp = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1_u64 << 52) - 1);
    // multiplier == mantissa * 2^exp
    let (mantissa, exp) = if biased_exp == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1_u64 << 52), biased_exp - 1075)
    };

    // Fits, n < 2^64 and mantissa < 2^53.
    let product = n as u128 * mantissa as u128;
    if product == 0 {
        return Some(0);
    }

    if exp >= 0 {
        if product.leading_zeros() < exp as u32 {
            return None;
        }
        return usize::try_from(product << exp).ok();
    }

    let shift = exp.unsigned_abs();
    let (whole, rem) = if shift >= u128::BITS {
        (0, product)
    } else {
        (product >> shift, product & ((1_u128 << shift) - 1))
    };

    // `rem` is in units of 2^exp. The multiplier is within half a unit of the
    // value it stands for, so the product is within n/2 units of its target.
    let error_below_half_row = shift >= u128::BITS || (n as u128) < (1_u128 << shift);
    let within_rounding = error_below_half_row && 2 * rem <= n as u128;
    if rem == 0 || within_rounding {
        usize::try_from(whole).ok()
    } else {
        usize::try_from(whole + 1).ok()
    }
}

/// Width information for a single output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Bytes the slot occupies in the buffer.
    pub padded_width: usize,
    /// Bytes of the slot holding the value.
    pub logical_width: usize,
}

/// Describes how output storage is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub columnar: bool,
    pub slots: Vec<SlotInfo>,
}

impl OutputLayout {
    /// Columnar layout with every output padded to a full 8 byte slot.
    pub fn for_table_function(unit: &TableFunctionExecutionUnit) -> Self {
        OutputLayout {
            columnar: true,
            slots: vec![
                SlotInfo {
                    padded_width: SLOT_BYTES,
                    logical_width: SLOT_BYTES,
                };
                unit.output_exprs.len()
            ],
        }
    }
}

/// Allocates output storage for a table function.
pub trait QueryBufferInitializer: Debug + Send + Sync {
    /// Allocate output buffers with room for `row_capacity` rows.
    ///
    /// `input_buffers` and `frag_offsets` hold one group per fragment. Table
    /// functions always pass a single group, with a fragment offset of 0.
    #[allow(clippy::too_many_arguments)]
    fn allocate(
        &self,
        unit: &TableFunctionExecutionUnit,
        layout: &OutputLayout,
        device_id: DeviceId,
        device_type: DeviceType,
        row_capacity: usize,
        input_buffers: &[Vec<*const u8>],
        frag_offsets: &[Vec<u64>],
        ctx: &mut AllocationContext,
    ) -> Result<OutputBuffers>;
}

#[derive(Debug, Clone, Copy)]
struct DeviceOutput {
    /// Device copy of the column-major storage.
    storage: DevicePtr,
    /// Array of column addresses within `storage`.
    column_ptrs: DevicePtr,
    dims: LaunchDims,
}

/// Output storage handed to a kernel, backing the final result.
#[derive(Debug)]
pub struct OutputBuffers {
    result: ResultSet,
    /// Host address of each column's slots.
    host_column_ptrs: Vec<*mut u8>,
    device: Option<DeviceOutput>,
}

impl OutputBuffers {
    pub fn new(mut result: ResultSet) -> Self {
        let host_column_ptrs = result.column_ptrs_mut();
        OutputBuffers {
            result,
            host_column_ptrs,
            device: None,
        }
    }

    /// The host output buffer array passed to a CPU kernel.
    pub fn host_buffers_ptr(&self) -> *const *mut u8 {
        self.host_column_ptrs.as_ptr()
    }

    pub fn result(&self) -> &ResultSet {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut ResultSet {
        &mut self.result
    }

    pub fn into_result(self) -> ResultSet {
        self.result
    }

    /// Mirror the output storage on the device, returning the address of the
    /// device output buffer array.
    ///
    /// Device memory is owned by `ctx`. The initial host contents are copied
    /// over so slots the kernel doesn't write read back as zero.
    pub fn setup_gpu_buffers(
        &mut self,
        ctx: &mut AllocationContext,
        dims: LaunchDims,
    ) -> Result<DevicePtr> {
        if self.device.is_some() {
            return Err(DbError::internal("Device output buffers already set up"));
        }

        let storage_bytes = self.result.storage_bytes();
        let storage = ctx.alloc_device_with(
            usize::max(storage_bytes, SLOT_BYTES),
            &self.result.storage_mut().as_bytes()[..storage_bytes],
        )?;

        let ptr_bytes: Vec<u8> = (0..self.result.num_columns())
            .flat_map(|idx| {
                storage
                    .byte_add(self.result.column_byte_offset(idx))
                    .0
                    .to_ne_bytes()
            })
            .collect();
        let column_ptrs =
            ctx.alloc_device_with(usize::max(ptr_bytes.len(), SLOT_BYTES), &ptr_bytes)?;

        debug!(
            %storage,
            storage_bytes,
            grid_size_x = dims.grid_size_x,
            block_size_x = dims.block_size_x,
            "set up device output buffers"
        );

        self.device = Some(DeviceOutput {
            storage,
            column_ptrs,
            dims,
        });

        Ok(column_ptrs)
    }

    /// Copy the first `row_count` rows of every column back from the device.
    pub fn copy_from_gpu(&mut self, allocator: &dyn DeviceAllocator, row_count: usize) -> Result<()> {
        let device = self.device.required("device output buffers")?;
        if row_count > self.result.capacity() {
            return Err(DbError::contract_violation(
                "Cannot copy more rows than were allocated",
            )
            .with_field("row_count", row_count)
            .with_field("capacity", self.result.capacity()));
        }

        let num_bytes = row_count * SLOT_BYTES;
        for idx in 0..self.result.num_columns() {
            let offset = self.result.column_byte_offset(idx);
            let dst = &mut self.result.storage_mut().as_bytes_mut()[offset..offset + num_bytes];
            allocator.copy_from_device(dst, device.storage.byte_add(offset))?;
        }

        trace!(
            row_count,
            column_ptrs = %device.column_ptrs,
            threads = device.dims.num_threads(),
            "copied output buffers from device"
        );

        Ok(())
    }
}

/// Allocates a single column-major region with one 8 byte slot per row per
/// output column.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnarBufferInitializer;

impl QueryBufferInitializer for ColumnarBufferInitializer {
    fn allocate(
        &self,
        unit: &TableFunctionExecutionUnit,
        layout: &OutputLayout,
        device_id: DeviceId,
        device_type: DeviceType,
        row_capacity: usize,
        input_buffers: &[Vec<*const u8>],
        frag_offsets: &[Vec<u64>],
        ctx: &mut AllocationContext,
    ) -> Result<OutputBuffers> {
        if !layout.columnar {
            not_implemented!("row-wise table function output");
        }
        if let Some(slot) = layout.slots.iter().find(|s| s.padded_width != SLOT_BYTES) {
            not_implemented!("table function output slot of width {}", slot.padded_width);
        }
        if let Some(slot) = layout
            .slots
            .iter()
            .find(|s| s.logical_width == 0 || s.logical_width > s.padded_width)
        {
            return Err(DbError::internal("Invalid output slot width")
                .with_field("logical_width", slot.logical_width)
                .with_field("padded_width", slot.padded_width));
        }
        if layout.slots.len() != unit.output_exprs.len() {
            return Err(DbError::internal("Output layout does not match output columns")
                .with_field("slots", layout.slots.len())
                .with_field("outputs", unit.output_exprs.len()));
        }
        if input_buffers.len() != 1 || frag_offsets.len() != 1 {
            return Err(DbError::internal("Expected a single fragment for table function output")
                .with_field("input_groups", input_buffers.len())
                .with_field("offset_groups", frag_offsets.len()));
        }
        if device_type != ctx.device_type() {
            return Err(DbError::internal("Allocation context is for a different device")
                .with_field("requested", device_type)
                .with_field("context", ctx.device_type()));
        }
        if device_type == DeviceType::Gpu {
            let ctx_device = ctx.device_allocator()?.device_id();
            if ctx_device != device_id {
                return Err(DbError::internal("Device allocator is for a different device")
                    .with_field("requested", device_id)
                    .with_field("allocator", ctx_device));
            }
        }

        let num_bytes = layout
            .slots
            .len()
            .checked_mul(row_capacity)
            .and_then(|n| n.checked_mul(SLOT_BYTES))
            .ok_or_else(|| {
                DbError::config("Output allocation too large")
                    .with_field("columns", layout.slots.len())
                    .with_field("rows", row_capacity)
            })?;

        // Owned by the result, not the allocation context.
        let storage = AlignedBuffer::try_new_zeroed(ctx.buffer_manager(), num_bytes)?;
        let column_types = unit.output_exprs.iter().map(|c| c.datatype.clone()).collect();
        let result = ResultSet::try_new(column_types, storage, row_capacity)?;

        trace!(
            function = %unit.name,
            %device_type,
            row_capacity,
            num_inputs = input_buffers[0].len(),
            "allocated table function output"
        );

        Ok(OutputBuffers::new(result))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tfexec_error::ErrorKind;

    use super::*;
    use crate::arrays::datatype::DataType;
    use crate::buffer::buffer_manager::{NopBufferManager, TrackedBufferManager};
    use crate::execution_unit::OutputColumn;
    use crate::testutil::device::HostBackedDeviceAllocator;

    fn unit(sizing: Option<OutputRowSizing>, outputs: usize) -> TableFunctionExecutionUnit {
        TableFunctionExecutionUnit {
            name: "test_fn".to_string(),
            input_exprs: Vec::new(),
            output_exprs: (0..outputs)
                .map(|idx| OutputColumn::new(format!("out{idx}"), DataType::Int64))
                .collect(),
            output_row_sizing: sizing,
        }
    }

    #[test]
    fn capacity_from_multiplier() {
        let u = unit(Some(OutputRowSizing::RowMultiplier(2.0)), 1);
        assert_eq!(20, output_row_capacity(&u, 10).unwrap());
        assert_eq!(0, output_row_capacity(&u, 0).unwrap());

        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 1);
        assert_eq!(100, output_row_capacity(&u, 100).unwrap());
    }

    #[test]
    fn capacity_rounds_up() {
        let u = unit(Some(OutputRowSizing::RowMultiplier(0.5)), 1);
        assert_eq!(2, output_row_capacity(&u, 3).unwrap());

        let u = unit(Some(OutputRowSizing::RowMultiplier(1.5)), 1);
        assert_eq!(5, output_row_capacity(&u, 3).unwrap());
    }

    #[test]
    fn capacity_ignores_multiplier_rounding_error() {
        let cases = [
            (10, 1.1, 11),
            (100, 0.3, 30),
            (1000, 1.7, 1700),
            (3, 0.1, 1),
            (7, 1.0 / 3.0, 3),
        ];
        for (n, m, expected) in cases {
            let u = unit(Some(OutputRowSizing::RowMultiplier(m)), 1);
            assert_eq!(expected, output_row_capacity(&u, n).unwrap(), "n={n}, m={m}");
        }
    }

    #[test]
    fn capacity_exact_for_large_row_counts() {
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 1);
        let n = (1_usize << 53) + 1;
        assert_eq!(n, output_row_capacity(&u, n).unwrap());

        let u = unit(Some(OutputRowSizing::RowMultiplier(0.5)), 1);
        let n = (1_usize << 60) + 3;
        assert_eq!((1 << 59) + 2, output_row_capacity(&u, n).unwrap());

        let u = unit(Some(OutputRowSizing::RowMultiplier(2.0)), 1);
        let err = output_row_capacity(&u, usize::MAX).unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());

        let u = unit(Some(OutputRowSizing::RowMultiplier(f64::MAX)), 1);
        let err = output_row_capacity(&u, 2).unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn capacity_is_deterministic_and_covers_bound() {
        for n in [0_usize, 1, 7, 1000, 12345] {
            for m in [0.1, 0.25, 1.0, 1.7, 3.0, 10.0] {
                let u = unit(Some(OutputRowSizing::RowMultiplier(m)), 1);
                let a = output_row_capacity(&u, n).unwrap();
                let b = output_row_capacity(&u, n).unwrap();
                assert_eq!(a, b);
                let bound = n as f64 * m;
                assert!(
                    a as f64 >= bound * (1.0 - 4.0 * f64::EPSILON),
                    "n={n}, m={m}, cap={a}"
                );
                assert!((a as f64) < bound + 1.0, "n={n}, m={m}, cap={a}");
            }
        }
    }

    #[test]
    fn missing_multiplier_is_config_error() {
        let err = output_row_capacity(&unit(None, 1), 10).unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn invalid_multipliers() {
        for m in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = output_row_capacity(&unit(Some(OutputRowSizing::RowMultiplier(m)), 1), 10)
                .unwrap_err();
            assert_eq!(ErrorKind::Config, err.kind());
        }
    }

    #[test]
    fn layout_pads_every_output() {
        let layout = OutputLayout::for_table_function(&unit(None, 3));
        assert!(layout.columnar);
        assert_eq!(3, layout.slots.len());
        assert!(
            layout
                .slots
                .iter()
                .all(|s| s.padded_width == 8 && s.logical_width == 8)
        );
    }

    #[test]
    fn host_allocation_owned_by_result() {
        let tracked = Arc::new(TrackedBufferManager::default());
        let mut ctx = AllocationContext::new_host(tracked.clone());
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 2);
        let layout = OutputLayout::for_table_function(&u);

        let buffers = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Cpu, 4, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap();
        assert_eq!(64, tracked.bytes_in_use());
        assert!(ctx.allocations().is_empty());

        std::mem::drop(ctx);
        assert_eq!(64, tracked.bytes_in_use());

        let result = buffers.into_result();
        assert_eq!(4, result.capacity());
        assert_eq!(2, result.num_columns());

        std::mem::drop(result);
        assert_eq!(0, tracked.bytes_in_use());
    }

    #[test]
    fn rejects_invalid_slot_widths() {
        let mut ctx = AllocationContext::new_host(Arc::new(NopBufferManager));
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 1);

        let mut layout = OutputLayout::for_table_function(&u);
        layout.slots[0].logical_width = 16;
        let err = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Cpu, 4, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());

        // Narrower values still occupy a full slot.
        layout.slots[0].logical_width = 4;
        let buffers = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Cpu, 4, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap();
        assert_eq!(4, buffers.result().capacity());

        layout.slots[0].padded_width = 4;
        let err = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Cpu, 4, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn rejects_multiple_fragments() {
        let mut ctx = AllocationContext::new_host(Arc::new(NopBufferManager));
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 1);
        let layout = OutputLayout::for_table_function(&u);

        let err = ColumnarBufferInitializer
            .allocate(
                &u,
                &layout,
                0,
                DeviceType::Cpu,
                4,
                &[Vec::new(), Vec::new()],
                &[vec![0], vec![4]],
                &mut ctx,
            )
            .unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());
    }

    #[test]
    fn device_round_trip() {
        let device = Arc::new(HostBackedDeviceAllocator::new(0));
        let mut ctx = AllocationContext::new_device(Arc::new(NopBufferManager), device.clone());
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 2);
        let layout = OutputLayout::for_table_function(&u);

        let mut buffers = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Gpu, 3, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap();

        let array = buffers
            .setup_gpu_buffers(&mut ctx, LaunchDims::default())
            .unwrap();
        assert_eq!(2, device.live_allocations());

        // Write to the second column on the "device".
        let mut ptr_bytes = [0; 16];
        device.copy_from_device(&mut ptr_bytes, array).unwrap();
        let col1 = DevicePtr(u64::from_ne_bytes(ptr_bytes[8..].try_into().unwrap()));
        device
            .copy_to_device(col1, &[11_i64.to_ne_bytes(), 12_i64.to_ne_bytes()].concat())
            .unwrap();

        buffers.copy_from_gpu(device.as_ref(), 2).unwrap();
        buffers.result_mut().update_storage_entry_count(2).unwrap();

        let result = buffers.into_result();
        assert_eq!(vec![0, 0], result.column_i64(0).unwrap());
        assert_eq!(vec![11, 12], result.column_i64(1).unwrap());

        std::mem::drop(ctx);
        assert_eq!(0, device.live_allocations());
    }

    #[test]
    fn device_mismatch() {
        let device = Arc::new(HostBackedDeviceAllocator::new(1));
        let mut ctx = AllocationContext::new_device(Arc::new(NopBufferManager), device);
        let u = unit(Some(OutputRowSizing::RowMultiplier(1.0)), 1);
        let layout = OutputLayout::for_table_function(&u);

        let err = ColumnarBufferInitializer
            .allocate(&u, &layout, 0, DeviceType::Gpu, 3, &[Vec::new()], &[vec![0]], &mut ctx)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
