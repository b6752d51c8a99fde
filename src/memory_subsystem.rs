pub mod memory_subsystem;
pub mod store_buffer;
