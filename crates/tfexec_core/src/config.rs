use serde::{Deserialize, Serialize};
use tfexec_error::{DbError, Result};

use crate::device::{DeviceId, LaunchDims};

/// What to do when a device kernel leaves the output row count cell negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsetRowCountPolicy {
    /// Treat the whole allocated capacity as output.
    #[default]
    FallbackToCapacity,
    /// Fail the invocation, matching the host path.
    Strict,
}

/// Configuration for table function execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableFunctionExecConfig {
    /// Device to run on. Only a single device is used per invocation.
    pub device_id: DeviceId,
    /// Launch shape for device kernels, from the device's capabilities.
    pub launch: LaunchDims,
    pub gpu_unset_row_count: UnsetRowCountPolicy,
    /// Value written to the device output row count cell before launch.
    pub row_count_sentinel: i64,
}

impl Default for TableFunctionExecConfig {
    fn default() -> Self {
        TableFunctionExecConfig {
            device_id: 0,
            launch: LaunchDims::default(),
            gpu_unset_row_count: UnsetRowCountPolicy::default(),
            row_count_sentinel: -1,
        }
    }
}

impl TableFunctionExecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.row_count_sentinel >= 0 {
            return Err(DbError::config("Row count sentinel must be negative")
                .with_field("sentinel", self.row_count_sentinel));
        }
        if self.launch.grid_size_x == 0 || self.launch.block_size_x == 0 {
            return Err(DbError::config("Launch dimensions must be non-zero")
                .with_field("grid_size_x", self.launch.grid_size_x)
                .with_field("block_size_x", self.launch.block_size_x));
        }
        Ok(())
    }
}
