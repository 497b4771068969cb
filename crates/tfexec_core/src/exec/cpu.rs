use tfexec_error::{DbError, ErrorKind, Result, ResultExt};
use tracing::{debug, trace};

use super::TableFunctionExecutionContext;
use crate::allocation::AllocationContext;
use crate::device::DeviceType;
use crate::execution_unit::TableFunctionExecutionUnit;
use crate::kernel::TableFunctionCompilationContext;
use crate::result::ResultSet;

impl TableFunctionExecutionContext {
    /// Run the host kernel in-process.
    ///
    /// The kernel must report a non-negative row count on success.
    pub(super) fn launch_cpu_code(
        &self,
        unit: &TableFunctionExecutionUnit,
        compilation: &TableFunctionCompilationContext,
        col_buf_ptrs: &[*const u8],
        input_row_count: usize,
        ctx: &mut AllocationContext,
    ) -> Result<ResultSet> {
        let kernel = compilation.cpu_kernel()?;
        let mut output =
            self.allocate_output(unit, DeviceType::Cpu, col_buf_ptrs, input_row_count, ctx)?;

        let kernel_elem_count =
            i64::try_from(input_row_count).context("Input row count too large for kernel")?;
        let mut output_row_count: i64 = -1;

        debug!(function = %unit.name, input_row_count, "invoking CPU kernel");

        // SAFETY: Input pointers are held alive by the allocation context, and
        // output buffers by `output`. Both outlive the call.
        let err = unsafe {
            kernel(
                col_buf_ptrs.as_ptr(),
                &kernel_elem_count,
                output.host_buffers_ptr(),
                &mut output_row_count,
            )
        };

        if err != 0 {
            return Err(
                DbError::new(format!("Error executing table function: {err}"))
                    .with_kind(ErrorKind::Execution)
                    .with_field("function", &unit.name)
                    .with_field("code", err),
            );
        }

        if output_row_count < 0 {
            return Err(DbError::contract_violation(
                "Table function did not properly set output row count.",
            )
            .with_field("function", &unit.name)
            .with_field("output_row_count", output_row_count));
        }

        let row_count =
            usize::try_from(output_row_count).context("Output row count too large")?;
        output.result_mut().update_storage_entry_count(row_count)?;

        trace!(
            function = %unit.name,
            row_count,
            capacity = output.result().capacity(),
            "reconciled CPU output"
        );

        Ok(output.into_result())
    }
}
