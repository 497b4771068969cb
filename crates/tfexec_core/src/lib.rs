//! Execution of compiled table functions on the host or a GPU.
pub mod allocation;
pub mod arrays;
pub mod buffer;
pub mod config;
pub mod device;
pub mod exec;
pub mod execution_unit;
pub mod expr;
pub mod fetch;
pub mod kernel;
pub mod literal;
pub mod materialize;
pub mod output;
pub mod result;

pub mod testutil;
