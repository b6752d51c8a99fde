use thiserror::Error;

use crate::instructions::instructions::{Opcode, WordType};

/// Errors raised while simulating.
///
/// `CapacityExceeded` is backpressure: the backend checks for space before it
/// allocates and simply stalls, so it never escapes a cycle. The other
/// variants abort the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("{resource} is full")]
    CapacityExceeded { resource: &'static str },

    #[error("no functional unit is configured for {opcode:?} at pc {pc}")]
    UnroutableInstruction { opcode: Opcode, pc: usize },

    #[error("memory access to address {address} out of bounds at pc {pc}")]
    MemoryFault { address: WordType, pc: usize },

    #[error("simulation did not finish within {max_cycles} cycles")]
    CycleLimitExceeded { max_cycles: u64 },

    #[error("invalid program: {0}")]
    InvalidProgram(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
