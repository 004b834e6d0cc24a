// Instruction opcodes. Bits 7-6 of each opcode hold the operand count, bit 5
// marks ALU instructions and bit 4 marks instructions that set the pc, but
// nothing in the interpreter decodes them: each handler advances the pc itself.

pub const HLT: u8 = 0b0000_0001;
pub const RET: u8 = 0b0001_0001;
pub const PUSH: u8 = 0b0100_0101;
pub const POP: u8 = 0b0100_0110;
pub const PRN: u8 = 0b0100_0111;
pub const CALL: u8 = 0b0101_0000;
pub const JMP: u8 = 0b0101_0100;
pub const JEQ: u8 = 0b0101_0101;
pub const JNE: u8 = 0b0101_0110;
pub const NOT: u8 = 0b0110_1001;
pub const LDI: u8 = 0b1000_0010;
pub const ADD: u8 = 0b1010_0000;
pub const MUL: u8 = 0b1010_0010;
pub const MOD: u8 = 0b1010_0100;
pub const CMP: u8 = 0b1010_0111;
pub const AND: u8 = 0b1010_1000;
pub const OR: u8 = 0b1010_1010;
pub const XOR: u8 = 0b1010_1011;
pub const SHL: u8 = 0b1010_1100;
pub const SHR: u8 = 0b1010_1101;

/// Mnemonic for an opcode, `"UNKNOWN"` if the machine does not implement it.
pub fn instruction_name(opcode: u8) -> &'static str {
    match opcode {
        HLT => "HLT",
        RET => "RET",
        PUSH => "PUSH",
        POP => "POP",
        PRN => "PRN",
        CALL => "CALL",
        JMP => "JMP",
        JEQ => "JEQ",
        JNE => "JNE",
        NOT => "NOT",
        LDI => "LDI",
        ADD => "ADD",
        MUL => "MUL",
        MOD => "MOD",
        CMP => "CMP",
        AND => "AND",
        OR => "OR",
        XOR => "XOR",
        SHL => "SHL",
        SHR => "SHR",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_values() {
        assert_eq!(
            [HLT, RET, PUSH, POP, PRN, CALL, JMP, JEQ, JNE, LDI],
            [1, 17, 69, 70, 71, 80, 84, 85, 86, 130]
        );
        assert_eq!(
            [ADD, MUL, MOD, CMP, NOT, AND, OR, XOR, SHL, SHR],
            [160, 162, 164, 167, 105, 168, 170, 171, 172, 173]
        );
    }

    #[test]
    fn test_instruction_name() {
        assert_eq!(instruction_name(130), "LDI");
        assert_eq!(instruction_name(105), "NOT");
        assert_eq!(instruction_name(0), "UNKNOWN");
        assert_eq!(instruction_name(255), "UNKNOWN");
    }
}
