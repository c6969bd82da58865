//! R3000A instruction decoder and disassembler

use std::fmt::Write;

/// Raw instruction word with field accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Primary opcode (bits 26-31)
    #[inline(always)]
    pub fn op(self) -> u32 {
        self.0 >> 26
    }

    #[inline(always)]
    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn shamt(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }

    /// Secondary opcode of SPECIAL instructions
    #[inline(always)]
    pub fn funct(self) -> u32 {
        self.0 & 0x3F
    }

    #[inline(always)]
    pub fn imm16(self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Sign extended immediate
    #[inline(always)]
    pub fn simm16(self) -> u32 {
        self.0 as u16 as i16 as i32 as u32
    }

    /// Jump target field
    #[inline(always)]
    pub fn target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }

    /// Coprocessor number for COPn/LWCn/SWCn
    #[inline(always)]
    pub fn cop_index(self) -> u32 {
        (self.0 >> 26) & 3
    }

    /// Coprocessor command (COP2 GTE operation)
    #[inline(always)]
    pub fn is_cop_command(self) -> bool {
        self.0 & (1 << 25) != 0
    }
}

/// Decoded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // SPECIAL
    Sll,
    Srl,
    Sra,
    Sllv,
    Srlv,
    Srav,
    Jr,
    Jalr,
    Syscall,
    Break,
    Mfhi,
    Mthi,
    Mflo,
    Mtlo,
    Mult,
    Multu,
    Div,
    Divu,
    Add,
    Addu,
    Sub,
    Subu,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    // Branches
    Bcondz,
    J,
    Jal,
    Beq,
    Bne,
    Blez,
    Bgtz,
    // Immediate ALU
    Addi,
    Addiu,
    Slti,
    Sltiu,
    Andi,
    Ori,
    Xori,
    Lui,
    // Coprocessor
    Mfc0,
    Mtc0,
    Rfe,
    Mfc2,
    Cfc2,
    Mtc2,
    Ctc2,
    Gte,
    /// Any access to a coprocessor that doesn't exist
    CopUnusable,
    // Loads and stores
    Lb,
    Lh,
    Lwl,
    Lw,
    Lbu,
    Lhu,
    Lwr,
    Sb,
    Sh,
    Swl,
    Sw,
    Swr,
    Lwc2,
    Swc2,
    Invalid,
}

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    pub op: Operation,
}

/// Instruction decoder
pub struct CpuDecoder;

impl CpuDecoder {
    /// Decode a 32-bit instruction word
    pub fn decode(word: u32) -> DecodedInstruction {
        let i = Instruction(word);
        let op = match i.op() {
            0x00 => match i.funct() {
                0x00 => Operation::Sll,
                0x02 => Operation::Srl,
                0x03 => Operation::Sra,
                0x04 => Operation::Sllv,
                0x06 => Operation::Srlv,
                0x07 => Operation::Srav,
                0x08 => Operation::Jr,
                0x09 => Operation::Jalr,
                0x0C => Operation::Syscall,
                0x0D => Operation::Break,
                0x10 => Operation::Mfhi,
                0x11 => Operation::Mthi,
                0x12 => Operation::Mflo,
                0x13 => Operation::Mtlo,
                0x18 => Operation::Mult,
                0x19 => Operation::Multu,
                0x1A => Operation::Div,
                0x1B => Operation::Divu,
                0x20 => Operation::Add,
                0x21 => Operation::Addu,
                0x22 => Operation::Sub,
                0x23 => Operation::Subu,
                0x24 => Operation::And,
                0x25 => Operation::Or,
                0x26 => Operation::Xor,
                0x27 => Operation::Nor,
                0x2A => Operation::Slt,
                0x2B => Operation::Sltu,
                _ => Operation::Invalid,
            },
            0x01 => Operation::Bcondz,
            0x02 => Operation::J,
            0x03 => Operation::Jal,
            0x04 => Operation::Beq,
            0x05 => Operation::Bne,
            0x06 => Operation::Blez,
            0x07 => Operation::Bgtz,
            0x08 => Operation::Addi,
            0x09 => Operation::Addiu,
            0x0A => Operation::Slti,
            0x0B => Operation::Sltiu,
            0x0C => Operation::Andi,
            0x0D => Operation::Ori,
            0x0E => Operation::Xori,
            0x0F => Operation::Lui,
            0x10 => {
                if i.is_cop_command() {
                    if i.funct() == 0x10 {
                        Operation::Rfe
                    } else {
                        Operation::Invalid
                    }
                } else {
                    match i.rs() {
                        0x00 => Operation::Mfc0,
                        0x04 => Operation::Mtc0,
                        _ => Operation::Invalid,
                    }
                }
            }
            0x12 => {
                if i.is_cop_command() {
                    Operation::Gte
                } else {
                    match i.rs() {
                        0x00 => Operation::Mfc2,
                        0x02 => Operation::Cfc2,
                        0x04 => Operation::Mtc2,
                        0x06 => Operation::Ctc2,
                        _ => Operation::Invalid,
                    }
                }
            }
            0x11 | 0x13 | 0x30 | 0x31 | 0x33 | 0x38 | 0x39 | 0x3B => Operation::CopUnusable,
            0x20 => Operation::Lb,
            0x21 => Operation::Lh,
            0x22 => Operation::Lwl,
            0x23 => Operation::Lw,
            0x24 => Operation::Lbu,
            0x25 => Operation::Lhu,
            0x26 => Operation::Lwr,
            0x28 => Operation::Sb,
            0x29 => Operation::Sh,
            0x2A => Operation::Swl,
            0x2B => Operation::Sw,
            0x2E => Operation::Swr,
            0x32 => Operation::Lwc2,
            0x3A => Operation::Swc2,
            _ => Operation::Invalid,
        };

        DecodedInstruction { instruction: i, op }
    }
}

impl DecodedInstruction {
    /// Raw word
    #[inline]
    pub fn bits(&self) -> u32 {
        self.instruction.0
    }

    /// Changes control flow and is followed by a delay slot
    pub fn is_branch(&self) -> bool {
        matches!(
            self.op,
            Operation::J
                | Operation::Jal
                | Operation::Jr
                | Operation::Jalr
                | Operation::Beq
                | Operation::Bne
                | Operation::Blez
                | Operation::Bgtz
                | Operation::Bcondz
        )
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self.op,
            Operation::Lb
                | Operation::Lh
                | Operation::Lwl
                | Operation::Lw
                | Operation::Lbu
                | Operation::Lhu
                | Operation::Lwr
                | Operation::Lwc2
        )
    }

    pub fn is_store(&self) -> bool {
        matches!(
            self.op,
            Operation::Sb
                | Operation::Sh
                | Operation::Swl
                | Operation::Sw
                | Operation::Swr
                | Operation::Swc2
        )
    }

    /// Result lands in a GPR one instruction late
    pub fn has_load_delay(&self) -> bool {
        matches!(
            self.op,
            Operation::Lb
                | Operation::Lh
                | Operation::Lwl
                | Operation::Lw
                | Operation::Lbu
                | Operation::Lhu
                | Operation::Lwr
                | Operation::Mfc0
                | Operation::Mfc2
                | Operation::Cfc2
        )
    }

    /// Whether executing this can raise an exception
    pub fn can_trap(&self, user_mode: bool) -> bool {
        match self.op {
            Operation::Add
            | Operation::Sub
            | Operation::Addi
            | Operation::Syscall
            | Operation::Break
            | Operation::CopUnusable
            | Operation::Invalid => true,
            _ if self.is_load() || self.is_store() => true,
            Operation::Mfc0
            | Operation::Mtc0
            | Operation::Rfe
            | Operation::Mfc2
            | Operation::Cfc2
            | Operation::Mtc2
            | Operation::Ctc2
            | Operation::Gte => user_mode,
            _ => false,
        }
    }

    /// Ends a block without being a branch
    pub fn is_exit_block(&self) -> bool {
        matches!(self.op, Operation::Syscall | Operation::Break)
    }

    pub fn is_invalid(&self) -> bool {
        self.op == Operation::Invalid
    }

    /// Human readable form of the instruction at `pc`
    pub fn disassemble(&self, pc: u32) -> String {
        let i = self.instruction;
        let mut s = String::new();
        let rs = REG_NAMES[i.rs()];
        let rt = REG_NAMES[i.rt()];
        let rd = REG_NAMES[i.rd()];
        let simm = i.simm16() as i32;
        let branch_target = pc.wrapping_add(4).wrapping_add(i.simm16() << 2);

        let _ = match self.op {
            Operation::Sll if i.0 == 0 => write!(s, "nop"),
            Operation::Sll | Operation::Srl | Operation::Sra => {
                write!(s, "{} {}, {}, {}", self.mnemonic(), rd, rt, i.shamt())
            }
            Operation::Sllv | Operation::Srlv | Operation::Srav => {
                write!(s, "{} {}, {}, {}", self.mnemonic(), rd, rt, rs)
            }
            Operation::Jr => write!(s, "jr {}", rs),
            Operation::Jalr => write!(s, "jalr {}, {}", rd, rs),
            Operation::Syscall | Operation::Break | Operation::Rfe => write!(s, "{}", self.mnemonic()),
            Operation::Mfhi | Operation::Mflo => write!(s, "{} {}", self.mnemonic(), rd),
            Operation::Mthi | Operation::Mtlo => write!(s, "{} {}", self.mnemonic(), rs),
            Operation::Mult | Operation::Multu | Operation::Div | Operation::Divu => {
                write!(s, "{} {}, {}", self.mnemonic(), rs, rt)
            }
            Operation::Add
            | Operation::Addu
            | Operation::Sub
            | Operation::Subu
            | Operation::And
            | Operation::Or
            | Operation::Xor
            | Operation::Nor
            | Operation::Slt
            | Operation::Sltu => write!(s, "{} {}, {}, {}", self.mnemonic(), rd, rs, rt),
            Operation::Bcondz => {
                let ge = i.rt() & 1 != 0;
                let link = i.rt() & 0x1E == 0x10;
                let name = match (ge, link) {
                    (false, false) => "bltz",
                    (true, false) => "bgez",
                    (false, true) => "bltzal",
                    (true, true) => "bgezal",
                };
                write!(s, "{} {}, 0x{:08x}", name, rs, branch_target)
            }
            Operation::J | Operation::Jal => write!(
                s,
                "{} 0x{:08x}",
                self.mnemonic(),
                (pc.wrapping_add(4) & 0xF000_0000) | (i.target() << 2)
            ),
            Operation::Beq | Operation::Bne => {
                write!(s, "{} {}, {}, 0x{:08x}", self.mnemonic(), rs, rt, branch_target)
            }
            Operation::Blez | Operation::Bgtz => {
                write!(s, "{} {}, 0x{:08x}", self.mnemonic(), rs, branch_target)
            }
            Operation::Addi | Operation::Addiu | Operation::Slti | Operation::Sltiu => {
                write!(s, "{} {}, {}, {}", self.mnemonic(), rt, rs, simm)
            }
            Operation::Andi | Operation::Ori | Operation::Xori => {
                write!(s, "{} {}, {}, 0x{:04x}", self.mnemonic(), rt, rs, i.imm16())
            }
            Operation::Lui => write!(s, "lui {}, 0x{:04x}", rt, i.imm16()),
            Operation::Mfc0 | Operation::Mtc0 => {
                write!(s, "{} {}, $cop0_{}", self.mnemonic(), rt, i.rd())
            }
            Operation::Mfc2 | Operation::Mtc2 => {
                write!(s, "{} {}, $gte_d{}", self.mnemonic(), rt, i.rd())
            }
            Operation::Cfc2 | Operation::Ctc2 => {
                write!(s, "{} {}, $gte_c{}", self.mnemonic(), rt, i.rd())
            }
            Operation::Gte => write!(s, "gte 0x{:07x}", i.0 & 0x1FF_FFFF),
            Operation::CopUnusable => write!(s, "cop{} 0x{:08x}", i.cop_index(), i.0),
            Operation::Lwc2 | Operation::Swc2 => {
                write!(s, "{} $gte_d{}, {}({})", self.mnemonic(), i.rt(), simm, rs)
            }
            Operation::Lb
            | Operation::Lh
            | Operation::Lwl
            | Operation::Lw
            | Operation::Lbu
            | Operation::Lhu
            | Operation::Lwr
            | Operation::Sb
            | Operation::Sh
            | Operation::Swl
            | Operation::Sw
            | Operation::Swr => write!(s, "{} {}, {}({})", self.mnemonic(), rt, simm, rs),
            Operation::Invalid => write!(s, "<invalid 0x{:08x}>", i.0),
        };

        s
    }

    /// Lower case mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self.op {
            Operation::Sll => "sll",
            Operation::Srl => "srl",
            Operation::Sra => "sra",
            Operation::Sllv => "sllv",
            Operation::Srlv => "srlv",
            Operation::Srav => "srav",
            Operation::Jr => "jr",
            Operation::Jalr => "jalr",
            Operation::Syscall => "syscall",
            Operation::Break => "break",
            Operation::Mfhi => "mfhi",
            Operation::Mthi => "mthi",
            Operation::Mflo => "mflo",
            Operation::Mtlo => "mtlo",
            Operation::Mult => "mult",
            Operation::Multu => "multu",
            Operation::Div => "div",
            Operation::Divu => "divu",
            Operation::Add => "add",
            Operation::Addu => "addu",
            Operation::Sub => "sub",
            Operation::Subu => "subu",
            Operation::And => "and",
            Operation::Or => "or",
            Operation::Xor => "xor",
            Operation::Nor => "nor",
            Operation::Slt => "slt",
            Operation::Sltu => "sltu",
            Operation::Bcondz => "bcondz",
            Operation::J => "j",
            Operation::Jal => "jal",
            Operation::Beq => "beq",
            Operation::Bne => "bne",
            Operation::Blez => "blez",
            Operation::Bgtz => "bgtz",
            Operation::Addi => "addi",
            Operation::Addiu => "addiu",
            Operation::Slti => "slti",
            Operation::Sltiu => "sltiu",
            Operation::Andi => "andi",
            Operation::Ori => "ori",
            Operation::Xori => "xori",
            Operation::Lui => "lui",
            Operation::Mfc0 => "mfc0",
            Operation::Mtc0 => "mtc0",
            Operation::Rfe => "rfe",
            Operation::Mfc2 => "mfc2",
            Operation::Cfc2 => "cfc2",
            Operation::Mtc2 => "mtc2",
            Operation::Ctc2 => "ctc2",
            Operation::Gte => "gte",
            Operation::CopUnusable => "cop",
            Operation::Lb => "lb",
            Operation::Lh => "lh",
            Operation::Lwl => "lwl",
            Operation::Lw => "lw",
            Operation::Lbu => "lbu",
            Operation::Lhu => "lhu",
            Operation::Lwr => "lwr",
            Operation::Sb => "sb",
            Operation::Sh => "sh",
            Operation::Swl => "swl",
            Operation::Sw => "sw",
            Operation::Swr => "swr",
            Operation::Lwc2 => "lwc2",
            Operation::Swc2 => "swc2",
            Operation::Invalid => "invalid",
        }
    }
}

/// Conventional MIPS register names
pub const REG_NAMES: [&str; 32] = [
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3", "$t0", "$t1", "$t2", "$t3", "$t4",
    "$t5", "$t6", "$t7", "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", "$t8", "$t9",
    "$k0", "$k1", "$gp", "$sp", "$fp", "$ra",
];
