use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions raised by the execution engine.
///
/// Division by zero is not among them: MOD halts the machine with
/// [`HaltReason::DivisionByZero`](crate::cpu::HaltReason::DivisionByZero).
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown instruction {opcode} (0x{opcode:02X}) at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("memory address {0} out of range, must be [0, 256)")]
    AddressOutOfRange(usize),
    #[error("register index {0} out of range, must be [0, 8)")]
    RegisterOutOfRange(u8),
    #[error("unsupported ALU operation {0:?}")]
    UnsupportedAluOperation(String),
    #[error("step limit of {0} instructions reached before halt")]
    StepLimitExceeded(u64),
    #[error("failed to write program output")]
    Output(#[from] io::Error),
}

impl MachineError {
    /// Short label used for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            MachineError::UnknownOpcode { .. } => "unknown_opcode",
            MachineError::AddressOutOfRange(_) => "address_out_of_range",
            MachineError::RegisterOutOfRange(_) => "register_out_of_range",
            MachineError::UnsupportedAluOperation(_) => "unsupported_alu_operation",
            MachineError::StepLimitExceeded(_) => "step_limit_exceeded",
            MachineError::Output(_) => "output",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read program {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: {text:?} is not an 8-bit binary literal")]
    InvalidLine { line: usize, text: String },
    #[error("program is {0} bytes, memory holds 256")]
    ProgramTooLarge(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("memory image is not valid base64")]
    Decode,
    #[error("memory image is {0} bytes, expected 256")]
    Size(usize),
    #[error("memory checksum mismatch")]
    Checksum,
}

pub type Result<T> = std::result::Result<T, MachineError>;
