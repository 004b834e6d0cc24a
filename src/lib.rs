//! # LS-8 Virtual Machine
//!
//! An interpreter for the LS-8, a teaching computer with eight 8-bit
//! registers, 256 bytes of RAM and a small fixed instruction set.
//!
//! ## Features
//!
//! - Table-driven dispatch over the full LS-8 instruction set
//! - ALU with 8-bit wrapping arithmetic and E/G/L comparison flags
//! - Downward-growing stack through R7 with CALL/RET subroutines
//! - Loader for the `.ls8` text format (one binary byte per line)
//! - Per-instruction tracing, Prometheus metrics and memory snapshots
//! - An HTTP control plane for hosting several machines at once
//!
//! ## Example
//!
//! ```rust
//! use ls8::{loader, Machine, SharedOutput, HaltReason};
//!
//! let program = loader::parse_program("
//!     10000010 # LDI R0,8
//!     00000000
//!     00001000
//!     01000111 # PRN R0
//!     00000000
//!     00000001 # HLT
//! ").unwrap();
//!
//! let output = SharedOutput::default();
//! let mut machine = Machine::with_output(Box::new(output.clone()));
//! machine.load(&program).unwrap();
//!
//! assert_eq!(machine.run().unwrap(), HaltReason::Halt);
//! assert_eq!(output.contents(), "8\n");
//! ```

#![recursion_limit = "2048"]

pub mod alu;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod metrics;
pub mod opcodes;
pub mod server;
pub mod snapshots;

pub use cpu::{Cpu, CpuState, HaltReason};
pub use error::{LoadError, MachineError, SnapshotError};
pub use machine::{Machine, SharedOutput};
pub use memory::Memory;
pub use snapshots::MachineSnapshot;
