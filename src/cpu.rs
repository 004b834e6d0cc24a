use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{MachineError, Result};
use crate::memory::MEMORY_SIZE;

pub const REGISTER_COUNT: usize = 8;

/// Register reserved for the stack pointer.
pub const SP: u8 = 7;

/// Initial stack pointer. The stack grows down from the top of memory.
pub const STACK_TOP: u8 = (MEMORY_SIZE - 1) as u8;

// Flags register, 00000LGE. Exactly one bit is set after a CMP.
pub const FLAG_EQUAL: u8 = 0b0000_0001;
pub const FLAG_GREATER: u8 = 0b0000_0010;
pub const FLAG_LESS: u8 = 0b0000_0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// HLT executed.
    Halt,
    /// MOD with a zero divisor.
    DivisionByZero,
    /// A fatal machine error stopped execution.
    Fault,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaltReason::Halt => "halt",
            HaltReason::DivisionByZero => "division_by_zero",
            HaltReason::Fault => "fault",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuState {
    Ready,
    Running,
    Halted(HaltReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    // Public for snapshot support
    pub reg: [u8; REGISTER_COUNT],
    pub pc: usize,
    pub fl: u8,
    pub state: CpuState,
    pub cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        let mut reg = [0; REGISTER_COUNT];
        reg[SP as usize] = STACK_TOP;
        Cpu {
            reg,
            pc: 0,
            fl: 0,
            state: CpuState::Ready,
            cycles: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Cpu::new();
    }

    pub fn reg(&self, index: u8) -> Result<u8> {
        self.reg
            .get(index as usize)
            .copied()
            .ok_or(MachineError::RegisterOutOfRange(index))
    }

    pub fn set_reg(&mut self, index: u8, value: u8) -> Result<()> {
        let slot = self
            .reg
            .get_mut(index as usize)
            .ok_or(MachineError::RegisterOutOfRange(index))?;
        *slot = value;
        Ok(())
    }

    pub fn sp(&self) -> u8 {
        self.reg[SP as usize]
    }

    pub fn set_sp(&mut self, value: u8) {
        self.reg[SP as usize] = value;
    }

    pub fn get_pc(&self) -> usize {
        self.pc
    }

    pub fn get_flags(&self) -> u8 {
        self.fl
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.fl & flag) != 0
    }

    /// Record the outcome of a comparison. Replaces every previous flag bit.
    pub fn set_comparison(&mut self, ordering: Ordering) {
        self.fl = match ordering {
            Ordering::Equal => FLAG_EQUAL,
            Ordering::Greater => FLAG_GREATER,
            Ordering::Less => FLAG_LESS,
        };
    }

    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, CpuState::Halted(_))
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self.state {
            CpuState::Halted(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn halt(&mut self, reason: HaltReason) {
        self.state = CpuState::Halted(reason);
    }

    pub fn advance(&mut self, width: usize) {
        self.pc += width;
    }
}
