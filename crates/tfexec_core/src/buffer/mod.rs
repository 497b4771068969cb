pub mod aligned;
pub mod buffer_manager;
