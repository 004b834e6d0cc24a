//! Register-to-register arithmetic and logic.
//!
//! Every result is an 8-bit value: ADD and MUL wrap modulo 256, NOT is the
//! one's complement within 8 bits, and shifts discard bits shifted out of the
//! byte (a shift by 8 or more yields 0).

use std::fmt;
use std::str::FromStr;

use crate::cpu::{Cpu, HaltReason};
use crate::error::{MachineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Mul,
    Mod,
    Cmp,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
}

impl AluOp {
    pub fn name(&self) -> &'static str {
        match self {
            AluOp::Add => "ADD",
            AluOp::Mul => "MUL",
            AluOp::Mod => "MOD",
            AluOp::Cmp => "CMP",
            AluOp::And => "AND",
            AluOp::Or => "OR",
            AluOp::Xor => "XOR",
            AluOp::Not => "NOT",
            AluOp::Shl => "SHL",
            AluOp::Shr => "SHR",
        }
    }
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AluOp {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s {
            "ADD" => AluOp::Add,
            "MUL" => AluOp::Mul,
            "MOD" => AluOp::Mod,
            "CMP" => AluOp::Cmp,
            "AND" => AluOp::And,
            "OR" => AluOp::Or,
            "XOR" => AluOp::Xor,
            "NOT" => AluOp::Not,
            "SHL" => AluOp::Shl,
            "SHR" => AluOp::Shr,
            _ => return Err(MachineError::UnsupportedAluOperation(s.to_string())),
        };
        Ok(op)
    }
}

impl Cpu {
    /// Apply `op` to registers `reg_a` and `reg_b`, storing into `reg_a`.
    ///
    /// CMP writes only the flags register. MOD by zero logs an error and
    /// halts the CPU, leaving `reg_a` untouched.
    pub fn alu(&mut self, op: AluOp, reg_a: u8, reg_b: u8) -> Result<()> {
        let a = self.reg(reg_a)?;
        // NOT ignores its second operand, which is often garbage from the
        // fetch window.
        let b = match op {
            AluOp::Not => 0,
            _ => self.reg(reg_b)?,
        };

        let result = match op {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::Mod => {
                if b == 0 {
                    tracing::error!(reg_a, reg_b, "cannot divide by zero");
                    self.halt(HaltReason::DivisionByZero);
                    return Ok(());
                }
                a % b
            }
            AluOp::Cmp => {
                self.set_comparison(a.cmp(&b));
                return Ok(());
            }
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Not => !a,
            AluOp::Shl => a.checked_shl(u32::from(b)).unwrap_or(0),
            AluOp::Shr => a.checked_shr(u32::from(b)).unwrap_or(0),
        };
        self.set_reg(reg_a, result)
    }

    /// Text-named ALU entry point; unknown names are fatal.
    pub fn alu_named(&mut self, op: &str, reg_a: u8, reg_b: u8) -> Result<()> {
        let op: AluOp = op.parse()?;
        self.alu(op, reg_a, reg_b)
    }
}
