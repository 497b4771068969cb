//! Table function invocation.
//!
//! An invocation resolves its inputs, sizes and allocates output storage,
//! runs the compiled kernel on the requested device, then reconciles the row
//! count the kernel reported with what was allocated.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;

use std::sync::Arc;

use tfexec_error::{DbError, OptionExt, Result};
use tracing::debug;

use crate::allocation::AllocationContext;
use crate::buffer::buffer_manager::BufferManager;
use crate::config::TableFunctionExecConfig;
use crate::device::DeviceType;
use crate::device::allocator::DeviceAllocator;
use crate::execution_unit::{InputTableInfo, TableFunctionExecutionUnit};
use crate::fetch::ColumnFetcher;
use crate::kernel::TableFunctionCompilationContext;
use crate::materialize::materialize_inputs;
use crate::output::{
    ColumnarBufferInitializer,
    OutputBuffers,
    OutputLayout,
    QueryBufferInitializer,
    output_row_capacity,
};
use crate::result::ResultSet;

/// Runs table functions against a single device.
///
/// Holds no per-invocation state. Every call to `execute` gets its own
/// allocation context, so a single execution context may be shared across
/// concurrent invocations.
#[derive(Debug, Clone)]
pub struct TableFunctionExecutionContext {
    config: TableFunctionExecConfig,
    buffer_manager: Arc<dyn BufferManager>,
    device_allocator: Option<Arc<dyn DeviceAllocator>>,
    buffer_initializer: Arc<dyn QueryBufferInitializer>,
}

impl TableFunctionExecutionContext {
    pub fn new(config: TableFunctionExecConfig, buffer_manager: Arc<dyn BufferManager>) -> Self {
        TableFunctionExecutionContext {
            config,
            buffer_manager,
            device_allocator: None,
            buffer_initializer: Arc::new(ColumnarBufferInitializer),
        }
    }

    /// Set the allocator for the configured device. Required for GPU
    /// execution.
    pub fn with_device_allocator(mut self, allocator: Arc<dyn DeviceAllocator>) -> Self {
        self.device_allocator = Some(allocator);
        self
    }

    pub fn with_buffer_initializer(mut self, initializer: Arc<dyn QueryBufferInitializer>) -> Self {
        self.buffer_initializer = initializer;
        self
    }

    pub fn config(&self) -> &TableFunctionExecConfig {
        &self.config
    }

    /// Execute a table function over a single fragment of its input table.
    ///
    /// Blocks until the kernel completes. All intermediate buffers are
    /// released before returning, on both success and error. The output
    /// storage is owned by the returned result.
    pub fn execute(
        &self,
        unit: &TableFunctionExecutionUnit,
        table_info: &InputTableInfo,
        compilation: Option<&TableFunctionCompilationContext>,
        fetcher: &dyn ColumnFetcher,
        device_type: DeviceType,
    ) -> Result<ResultSet> {
        self.config.validate()?;
        let compilation = compilation.required("compilation context")?;

        if device_type == DeviceType::Gpu && !cfg!(feature = "gpu") {
            return Err(gpu_not_compiled(unit));
        }

        let fragment = table_info.single_fragment()?;
        let mut ctx = match device_type {
            DeviceType::Cpu => AllocationContext::new_host(self.buffer_manager.clone()),
            DeviceType::Gpu => {
                let allocator = self.device_allocator.clone().ok_or_else(|| {
                    DbError::internal("Missing device allocator for GPU execution")
                        .with_field("function", &unit.name)
                        .with_field("device_id", self.config.device_id)
                })?;
                AllocationContext::new_device(self.buffer_manager.clone(), allocator)
            }
        };

        debug!(
            function = %unit.name,
            %device_type,
            fragment_id = fragment.fragment_id,
            num_inputs = unit.input_exprs.len(),
            "executing table function"
        );

        let inputs = materialize_inputs(unit, fragment, fetcher, self.config.device_id, &mut ctx)?;
        let input_row_count = inputs.input_row_count.ok_or_else(|| {
            DbError::config("Table function requires at least one column input")
                .with_field("function", &unit.name)
        })?;

        match device_type {
            DeviceType::Cpu => {
                self.launch_cpu_code(unit, compilation, &inputs.col_buf_ptrs, input_row_count, &mut ctx)
            }
            #[cfg(feature = "gpu")]
            DeviceType::Gpu => {
                self.launch_gpu_code(unit, compilation, &inputs.col_buf_ptrs, input_row_count, &mut ctx)
            }
            #[cfg(not(feature = "gpu"))]
            DeviceType::Gpu => Err(gpu_not_compiled(unit)),
        }
    }

    /// Size output storage from the input row count and allocate it through
    /// the buffer initializer.
    fn allocate_output(
        &self,
        unit: &TableFunctionExecutionUnit,
        device_type: DeviceType,
        col_buf_ptrs: &[*const u8],
        input_row_count: usize,
        ctx: &mut AllocationContext,
    ) -> Result<OutputBuffers> {
        let row_capacity = output_row_capacity(unit, input_row_count)?;
        let layout = OutputLayout::for_table_function(unit);

        debug!(function = %unit.name, input_row_count, row_capacity, "allocating table function output");

        self.buffer_initializer.allocate(
            unit,
            &layout,
            self.config.device_id,
            device_type,
            row_capacity,
            &[col_buf_ptrs.to_vec()],
            &[vec![0]],
            ctx,
        )
    }
}

fn gpu_not_compiled(unit: &TableFunctionExecutionUnit) -> DbError {
    DbError::internal("GPU execution support is not compiled in")
        .with_field("function", &unit.name)
}
