//! Utilities for testing table function execution without real devices or
//! storage.

pub mod device;
pub mod fetch;
pub mod kernel;
