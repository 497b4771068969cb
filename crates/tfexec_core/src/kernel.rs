//! The binary boundary between the dispatcher and compiled kernels.

use std::ffi::c_void;
use std::fmt::Debug;
use std::sync::Arc;

use tfexec_error::{DbError, Result};

use crate::device::{DeviceId, DevicePtr, LaunchDims};

/// Signature of a table function compiled for host execution.
///
/// Arguments are the array of input buffers (one per input, columns and
/// literal cells alike), a pointer to the input row count, the array of output
/// column buffers, and the out-parameter for the number of rows produced. A
/// non-zero return is an error status.
pub type CpuKernelFn = unsafe extern "C" fn(
    col_buffers: *const *const u8,
    input_row_count: *const i64,
    output_buffers: *const *mut u8,
    output_row_count: *mut i64,
) -> i32;

pub const KERNEL_PARAM_COUNT: usize = 5;

/// Arguments for a device kernel launch.
///
/// Field order is the order the code generator emits parameters in and must
/// not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct KernelParams {
    /// Cell the kernel may write an error code to.
    pub error_buffer: DevicePtr,
    /// Array of input buffer addresses.
    pub col_buffers: DevicePtr,
    /// Cell holding the input row count.
    pub input_row_count: DevicePtr,
    /// Array of output column addresses.
    pub output_buffers: DevicePtr,
    /// Cell the kernel writes the produced row count to.
    pub output_row_count: DevicePtr,
}

const _: () = assert!(
    std::mem::size_of::<KernelParams>() == KERNEL_PARAM_COUNT * std::mem::size_of::<u64>()
);

impl KernelParams {
    /// Pointers to each parameter cell, in launch order.
    ///
    /// The returned pointers borrow from `self`, which must outlive the
    /// launch.
    pub fn as_param_ptrs(&mut self) -> [*mut c_void; KERNEL_PARAM_COUNT] {
        [
            (&raw mut self.error_buffer).cast(),
            (&raw mut self.col_buffers).cast(),
            (&raw mut self.input_row_count).cast(),
            (&raw mut self.output_buffers).cast(),
            (&raw mut self.output_row_count).cast(),
        ]
    }
}

/// A table function compiled for a device.
pub trait GpuKernel: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Launch the kernel.
    ///
    /// Each entry of `params` points at a device-address-sized cell.
    ///
    /// # Safety
    ///
    /// Every address in the parameter cells must be a live allocation on
    /// `device_id` of the size the kernel expects.
    unsafe fn launch(
        &self,
        device_id: DeviceId,
        dims: LaunchDims,
        params: &mut [*mut c_void; KERNEL_PARAM_COUNT],
    ) -> Result<()>;
}

/// Compiled code for a table function, for each device it was compiled for.
#[derive(Debug, Clone, Default)]
pub struct TableFunctionCompilationContext {
    cpu: Option<CpuKernelFn>,
    gpu: Option<Arc<dyn GpuKernel>>,
}

impl TableFunctionCompilationContext {
    pub fn with_cpu(mut self, kernel: CpuKernelFn) -> Self {
        self.cpu = Some(kernel);
        self
    }

    pub fn with_gpu(mut self, kernel: Arc<dyn GpuKernel>) -> Self {
        self.gpu = Some(kernel);
        self
    }

    pub fn cpu_kernel(&self) -> Result<CpuKernelFn> {
        self.cpu
            .ok_or_else(|| DbError::internal("Table function was not compiled for CPU"))
    }

    pub fn gpu_kernel(&self) -> Result<&Arc<dyn GpuKernel>> {
        self.gpu
            .as_ref()
            .ok_or_else(|| DbError::internal("Table function was not compiled for GPU"))
    }
}
