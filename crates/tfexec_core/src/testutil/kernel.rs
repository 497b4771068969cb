use std::ffi::c_void;
use std::fmt;

use tfexec_error::{DbError, Result};

use crate::device::{DeviceId, LaunchDims};
use crate::kernel::{GpuKernel, KERNEL_PARAM_COUNT};

/// Device kernel body taking the five launch cells already dereferenced.
pub type SimulatedKernelFn = unsafe extern "C" fn(
    error_buffer: *mut i32,
    col_buffers: *const *const u8,
    input_row_count: *const i64,
    output_buffers: *const *mut u8,
    output_row_count: *mut i64,
);

/// Runs a host function as a device kernel on a host backed device.
///
/// The function is invoked once per launch, regardless of the launch
/// dimensions.
#[derive(Clone)]
pub struct FnGpuKernel {
    name: String,
    kernel: SimulatedKernelFn,
    fail_launch: bool,
}

impl FnGpuKernel {
    pub fn new(name: impl Into<String>, kernel: SimulatedKernelFn) -> Self {
        FnGpuKernel {
            name: name.into(),
            kernel,
            fail_launch: false,
        }
    }

    /// Make every launch fail as if the device runtime rejected it.
    pub fn with_launch_failure(mut self) -> Self {
        self.fail_launch = true;
        self
    }
}

impl fmt::Debug for FnGpuKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnGpuKernel")
            .field("name", &self.name)
            .field("fail_launch", &self.fail_launch)
            .finish_non_exhaustive()
    }
}

impl GpuKernel for FnGpuKernel {
    fn name(&self) -> &str {
        &self.name
    }

    unsafe fn launch(
        &self,
        device_id: DeviceId,
        dims: LaunchDims,
        params: &mut [*mut c_void; KERNEL_PARAM_COUNT],
    ) -> Result<()> {
        if self.fail_launch {
            return Err(DbError::new("Simulated launch failure")
                .with_field("kernel", &self.name)
                .with_field("device_id", device_id));
        }
        if dims.num_threads() == 0 {
            return Err(DbError::new("Empty launch"));
        }

        // SAFETY: Each param points at a cell holding a device address, and
        // device addresses are host addresses on a host backed device.
        unsafe {
            let cell = |idx: usize| *params[idx].cast::<u64>() as usize;
            (self.kernel)(
                cell(0) as *mut i32,
                cell(1) as *const *const u8,
                cell(2) as *const i64,
                cell(3) as *const *mut u8,
                cell(4) as *mut i64,
            );
        }

        Ok(())
    }
}
