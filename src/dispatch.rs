//! Opcode dispatch table and instruction handlers.
//!
//! A handler receives the machine and both operand bytes of the fetch window,
//! whether or not the instruction uses them, and is responsible for moving the
//! pc: by the instruction width, or directly for control transfers. Handlers
//! validate their operands before mutating anything, so a fatal error leaves
//! the machine as it was before the instruction.

use lazy_static::lazy_static;

use crate::alu::AluOp;
use crate::cpu::{HaltReason, FLAG_EQUAL};
use crate::error::{MachineError, Result};
use crate::machine::Machine;
use crate::opcodes::*;

pub type Handler = fn(&mut Machine, u8, u8) -> Result<()>;

lazy_static! {
    /// Built once, shared by every machine.
    pub static ref DISPATCH_TABLE: DispatchTable = DispatchTable::new();
}

pub struct DispatchTable {
    handlers: [Option<Handler>; 256],
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        let mut table = DispatchTable {
            handlers: [None; 256],
        };

        table.register(HLT, handle_hlt);
        table.register(RET, handle_ret);
        table.register(PUSH, handle_push);
        table.register(POP, handle_pop);
        table.register(PRN, handle_prn);
        table.register(CALL, handle_call);
        table.register(JMP, handle_jmp);
        table.register(JEQ, handle_jeq);
        table.register(JNE, handle_jne);
        table.register(LDI, handle_ldi);

        table.register(ADD, handle_add);
        table.register(MUL, handle_mul);
        table.register(MOD, handle_mod);
        table.register(CMP, handle_cmp);

        table.register(NOT, handle_not);
        table.register(AND, handle_and);
        table.register(OR, handle_or);
        table.register(XOR, handle_xor);
        table.register(SHL, handle_shl);
        table.register(SHR, handle_shr);

        table
    }

    fn register(&mut self, opcode: u8, handler: Handler) {
        let slot = &mut self.handlers[opcode as usize];
        assert!(slot.is_none(), "opcode 0x{:02X} registered twice", opcode);
        *slot = Some(handler);
    }

    pub fn get(&self, opcode: u8) -> Option<Handler> {
        self.handlers[opcode as usize]
    }

    pub fn contains(&self, opcode: u8) -> bool {
        self.handlers[opcode as usize].is_some()
    }

    pub fn opcodes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |&opcode| self.contains(opcode))
    }
}

fn handle_hlt(machine: &mut Machine, _: u8, _: u8) -> Result<()> {
    machine.cpu.halt(HaltReason::Halt);
    machine.cpu.advance(1);
    Ok(())
}

fn handle_ldi(machine: &mut Machine, reg: u8, value: u8) -> Result<()> {
    machine.cpu.set_reg(reg, value)?;
    machine.cpu.advance(3);
    Ok(())
}

fn handle_prn(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    let value = machine.cpu.reg(reg)?;
    machine.print(value)?;
    machine.cpu.advance(2);
    Ok(())
}

// The stack pointer wraps within the 8-bit register. Nothing stops the stack
// from growing into the program.

fn push_value(machine: &mut Machine, value: u8) -> Result<()> {
    let sp = machine.cpu.sp().wrapping_sub(1);
    machine.ram_write(sp as usize, value)?;
    machine.cpu.set_sp(sp);
    Ok(())
}

fn pop_value(machine: &mut Machine) -> Result<u8> {
    let sp = machine.cpu.sp();
    let value = machine.ram_read(sp as usize)?;
    machine.cpu.set_sp(sp.wrapping_add(1));
    Ok(value)
}

fn handle_push(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    let value = machine.cpu.reg(reg)?;
    push_value(machine, value)?;
    machine.cpu.advance(2);
    Ok(())
}

fn handle_pop(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    // validate the destination before moving the stack pointer
    machine.cpu.reg(reg)?;
    let value = pop_value(machine)?;
    machine.cpu.set_reg(reg, value)?;
    machine.cpu.advance(2);
    Ok(())
}

fn handle_call(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    let target = machine.cpu.reg(reg)?;
    let return_pc = machine.cpu.get_pc() + 2;
    let return_address =
        u8::try_from(return_pc).map_err(|_| MachineError::AddressOutOfRange(return_pc))?;
    push_value(machine, return_address)?;
    machine.cpu.pc = target as usize;
    Ok(())
}

fn handle_ret(machine: &mut Machine, _: u8, _: u8) -> Result<()> {
    let address = pop_value(machine)?;
    machine.cpu.pc = address as usize;
    Ok(())
}

fn handle_jmp(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    machine.cpu.pc = machine.cpu.reg(reg)? as usize;
    Ok(())
}

fn jump_if(machine: &mut Machine, condition: bool, reg: u8) -> Result<()> {
    let target = machine.cpu.reg(reg)?;
    if condition {
        machine.cpu.pc = target as usize;
    } else {
        machine.cpu.advance(2);
    }
    Ok(())
}

fn handle_jeq(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    let equal = machine.cpu.get_flag(FLAG_EQUAL);
    jump_if(machine, equal, reg)
}

fn handle_jne(machine: &mut Machine, reg: u8, _: u8) -> Result<()> {
    let equal = machine.cpu.get_flag(FLAG_EQUAL);
    jump_if(machine, !equal, reg)
}

fn alu(machine: &mut Machine, op: AluOp, reg_a: u8, reg_b: u8, width: usize) -> Result<()> {
    machine.cpu.alu(op, reg_a, reg_b)?;
    machine.cpu.advance(width);
    Ok(())
}

fn handle_add(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Add, a, b, 3)
}

fn handle_mul(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Mul, a, b, 3)
}

fn handle_mod(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Mod, a, b, 3)
}

fn handle_cmp(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Cmp, a, b, 3)
}

fn handle_not(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Not, a, b, 2)
}

fn handle_and(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::And, a, b, 3)
}

fn handle_or(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Or, a, b, 3)
}

fn handle_xor(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Xor, a, b, 3)
}

fn handle_shl(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Shl, a, b, 3)
}

fn handle_shr(machine: &mut Machine, a: u8, b: u8) -> Result<()> {
    alu(machine, AluOp::Shr, a, b, 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{FLAG_GREATER, STACK_TOP};
    use crate::machine::SharedOutput;

    fn machine() -> (Machine, SharedOutput) {
        let output = SharedOutput::default();
        let machine = Machine::with_output(Box::new(output.clone()));
        (machine, output)
    }

    fn exec(machine: &mut Machine, opcode: u8, a: u8, b: u8) -> Result<()> {
        let handler = DISPATCH_TABLE.get(opcode).expect("opcode is registered");
        handler(machine, a, b)
    }

    #[test]
    fn test_table_contents() {
        let opcodes: Vec<u8> = DISPATCH_TABLE.opcodes().collect();
        assert_eq!(
            opcodes,
            vec![1, 17, 69, 70, 71, 80, 84, 85, 86, 105, 130, 160, 162, 164, 167, 168, 170, 171, 172, 173]
        );
        assert!(!DISPATCH_TABLE.contains(0));
        assert!(!DISPATCH_TABLE.contains(255));
    }

    #[test]
    fn test_pc_advance_per_instruction() {
        let cases = [
            (HLT, 1),
            (PUSH, 2),
            (POP, 2),
            (PRN, 2),
            (NOT, 2),
            (LDI, 3),
            (ADD, 3),
            (MUL, 3),
            (CMP, 3),
            (AND, 3),
            (OR, 3),
            (XOR, 3),
            (SHL, 3),
            (SHR, 3),
        ];
        for (opcode, width) in cases {
            let (mut machine, _) = machine();
            machine.cpu.set_reg(1, 1).unwrap();
            machine.cpu.pc = 10;
            exec(&mut machine, opcode, 0, 1).unwrap();
            assert_eq!(machine.cpu.get_pc(), 10 + width, "opcode {}", opcode);
        }
    }

    #[test]
    fn test_ldi() {
        let (mut machine, _) = machine();
        exec(&mut machine, LDI, 4, 200).unwrap();
        assert_eq!(machine.cpu.reg(4).unwrap(), 200);
    }

    #[test]
    fn test_prn_writes_decimal_line() {
        let (mut machine, output) = machine();
        machine.cpu.set_reg(2, 72).unwrap();
        exec(&mut machine, PRN, 2, 0).unwrap();
        assert_eq!(output.contents(), "72\n");
    }

    #[test]
    fn test_push_pop() {
        let (mut machine, _) = machine();
        machine.cpu.set_reg(0, 0x42).unwrap();

        exec(&mut machine, PUSH, 0, 0).unwrap();
        assert_eq!(machine.cpu.sp(), STACK_TOP - 1);
        assert_eq!(machine.ram_read(0xFE).unwrap(), 0x42);

        machine.cpu.set_reg(0, 0).unwrap();
        exec(&mut machine, POP, 0, 0).unwrap();
        assert_eq!(machine.cpu.reg(0).unwrap(), 0x42);
        assert_eq!(machine.cpu.sp(), STACK_TOP);
    }

    #[test]
    fn test_pop_into_invalid_register_keeps_stack() {
        let (mut machine, _) = machine();
        machine.cpu.set_sp(0xF0);
        assert!(matches!(
            exec(&mut machine, POP, 8, 0),
            Err(MachineError::RegisterOutOfRange(8))
        ));
        assert_eq!(machine.cpu.sp(), 0xF0);
    }

    #[test]
    fn test_stack_pointer_wraps() {
        let (mut machine, _) = machine();
        machine.cpu.set_sp(0);
        machine.cpu.set_reg(1, 9).unwrap();
        exec(&mut machine, PUSH, 1, 0).unwrap();
        assert_eq!(machine.cpu.sp(), 0xFF);
        assert_eq!(machine.ram_read(0xFF).unwrap(), 9);

        exec(&mut machine, POP, 2, 0).unwrap();
        assert_eq!(machine.cpu.sp(), 0);
        assert_eq!(machine.cpu.reg(2).unwrap(), 9);
    }

    #[test]
    fn test_call_ret() {
        let (mut machine, _) = machine();
        machine.cpu.set_reg(1, 0x30).unwrap();
        machine.cpu.pc = 0x10;

        exec(&mut machine, CALL, 1, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 0x30);
        assert_eq!(machine.cpu.sp(), STACK_TOP - 1);
        assert_eq!(machine.ram_read(0xFE).unwrap(), 0x12);

        exec(&mut machine, RET, 0, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 0x12);
        assert_eq!(machine.cpu.sp(), STACK_TOP);
    }

    #[test]
    fn test_jmp() {
        let (mut machine, _) = machine();
        machine.cpu.set_reg(3, 0x80).unwrap();
        exec(&mut machine, JMP, 3, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 0x80);
    }

    #[test]
    fn test_conditional_jumps() {
        let (mut machine, _) = machine();
        machine.cpu.set_reg(3, 0x80).unwrap();

        machine.cpu.fl = FLAG_EQUAL;
        exec(&mut machine, JEQ, 3, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 0x80);

        machine.cpu.pc = 0;
        exec(&mut machine, JNE, 3, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 2);

        machine.cpu.fl = FLAG_GREATER;
        machine.cpu.pc = 0;
        exec(&mut machine, JEQ, 3, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 2);

        machine.cpu.pc = 0;
        exec(&mut machine, JNE, 3, 0).unwrap();
        assert_eq!(machine.cpu.get_pc(), 0x80);
    }

    // Flags are only written by CMP; a stale comparison keeps steering jumps.
    #[test]
    fn test_flags_persist_across_other_instructions() {
        let (mut machine, _) = machine();
        machine.cpu.fl = FLAG_EQUAL;
        machine.cpu.set_reg(1, 5).unwrap();
        exec(&mut machine, ADD, 0, 1).unwrap();
        exec(&mut machine, LDI, 2, 0).unwrap();
        exec(&mut machine, PUSH, 0, 0).unwrap();
        assert_eq!(machine.cpu.get_flags(), FLAG_EQUAL);
    }

    #[test]
    fn test_hlt() {
        let (mut machine, _) = machine();
        exec(&mut machine, HLT, 0, 0).unwrap();
        assert_eq!(machine.cpu.halt_reason(), Some(HaltReason::Halt));
    }

    #[test]
    fn test_mod_by_zero_still_advances() {
        let (mut machine, _) = machine();
        machine.cpu.set_reg(0, 5).unwrap();
        exec(&mut machine, MOD, 0, 1).unwrap();
        assert_eq!(machine.cpu.halt_reason(), Some(HaltReason::DivisionByZero));
        assert_eq!(machine.cpu.get_pc(), 3);
        assert_eq!(machine.cpu.reg(0).unwrap(), 5);
    }
}
