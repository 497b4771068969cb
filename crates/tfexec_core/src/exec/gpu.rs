use tfexec_error::{DbError, ErrorKind, Result, ResultExt};
use tracing::{debug, trace, warn};

use super::TableFunctionExecutionContext;
use crate::allocation::AllocationContext;
use crate::buffer::aligned::SLOT_BYTES;
use crate::config::UnsetRowCountPolicy;
use crate::device::DeviceType;
use crate::execution_unit::TableFunctionExecutionUnit;
use crate::kernel::{KernelParams, TableFunctionCompilationContext};
use crate::result::ResultSet;

impl TableFunctionExecutionContext {
    /// Stage inputs on the device, launch the device kernel, and copy the
    /// output back to the host.
    ///
    /// `col_buf_ptrs` must already hold device addresses.
    pub(super) fn launch_gpu_code(
        &self,
        unit: &TableFunctionExecutionUnit,
        compilation: &TableFunctionCompilationContext,
        col_buf_ptrs: &[*const u8],
        input_row_count: usize,
        ctx: &mut AllocationContext,
    ) -> Result<ResultSet> {
        let kernel = compilation.gpu_kernel()?.clone();
        let allocator = ctx.device_allocator()?.clone();

        let ptr_bytes: Vec<u8> = col_buf_ptrs
            .iter()
            .flat_map(|ptr| (*ptr as usize as u64).to_ne_bytes())
            .collect();
        let col_buffers =
            ctx.alloc_device_with(usize::max(ptr_bytes.len(), SLOT_BYTES), &ptr_bytes)?;

        let kernel_elem_count =
            i64::try_from(input_row_count).context("Input row count too large for kernel")?;
        let input_row_count_cell =
            ctx.alloc_device_with(SLOT_BYTES, &kernel_elem_count.to_ne_bytes())?;

        // Left uninitialized.
        let error_buffer = ctx.alloc_device(SLOT_BYTES)?;

        let mut output =
            self.allocate_output(unit, DeviceType::Gpu, col_buf_ptrs, input_row_count, ctx)?;
        let capacity = output.result().capacity();

        let output_row_count = ctx.alloc_device_with(
            SLOT_BYTES,
            &self.config.row_count_sentinel.to_ne_bytes(),
        )?;
        let output_buffers = output.setup_gpu_buffers(ctx, self.config.launch)?;

        let mut params = KernelParams {
            error_buffer,
            col_buffers,
            input_row_count: input_row_count_cell,
            output_buffers,
            output_row_count,
        };
        let mut param_ptrs = params.as_param_ptrs();

        debug!(
            function = %unit.name,
            kernel = kernel.name(),
            device_id = self.config.device_id,
            grid = ?self.config.launch.grid(),
            block = ?self.config.launch.block(),
            input_row_count,
            "launching GPU kernel"
        );

        // SAFETY: Every parameter cell holds an address allocated on this
        // device and owned by `ctx` (or a column handle held by it), which
        // outlives the launch. `params` outlives `param_ptrs`.
        let launched =
            unsafe { kernel.launch(self.config.device_id, self.config.launch, &mut param_ptrs) };
        launched.map_err(|e| {
            DbError::with_source("Failed to launch table function kernel", Box::new(e))
                .with_kind(ErrorKind::Internal)
                .with_field("function", &unit.name)
                .with_field("kernel", kernel.name())
        })?;
        allocator.synchronize().map_err(|e| {
            DbError::with_source("Device synchronization failed", Box::new(e))
                .with_kind(ErrorKind::Internal)
                .with_field("device_id", self.config.device_id)
        })?;

        let mut row_count_bytes = [0; 8];
        allocator.copy_from_device(&mut row_count_bytes, output_row_count)?;
        let reported = i64::from_ne_bytes(row_count_bytes);

        let row_count = if reported < 0 {
            match self.config.gpu_unset_row_count {
                UnsetRowCountPolicy::FallbackToCapacity => {
                    warn!(
                        function = %unit.name,
                        reported,
                        capacity,
                        "kernel did not set output row count, using allocated capacity"
                    );
                    capacity
                }
                UnsetRowCountPolicy::Strict => {
                    return Err(DbError::contract_violation(
                        "Table function did not properly set output row count.",
                    )
                    .with_field("function", &unit.name)
                    .with_field("output_row_count", reported));
                }
            }
        } else {
            usize::try_from(reported).context("Output row count too large")?
        };

        output.result_mut().update_storage_entry_count(row_count)?;
        output.copy_from_gpu(allocator.as_ref(), row_count)?;

        trace!(function = %unit.name, reported, row_count, capacity, "reconciled GPU output");

        Ok(output.into_result())
    }
}
