pub mod backend;
pub mod cpu;
pub mod error;
pub mod frontend;
pub mod instructions;
pub mod loader;
pub mod memory_subsystem;

#[cfg(test)]
mod cpu_tests;

pub use crate::cpu::{load_cpu_config, CPUConfig, PerfCounters, CPU};
pub use crate::error::{ConfigError, SimError};
pub use crate::instructions::instructions::{ArchReg, Instr, IssuedInstr, Opcode, Program, Source, Value};
pub use crate::loader::loader::{load, load_from_string, LoadError};
