//! Branch and jump instructions
//!
//! At execution time `regs.pc` already points at the delay slot and
//! `regs.npc` at the instruction after it, so link values are `npc` and
//! relative targets are computed from `pc`.

use crate::cpu::Cpu;
use crate::decoder::Instruction;

#[inline]
fn relative_target(cpu: &Cpu, i: Instruction) -> u32 {
    cpu.regs.pc.wrapping_add(i.simm16() << 2)
}

pub fn j(cpu: &mut Cpu, i: Instruction) {
    let target = (cpu.regs.pc & 0xF000_0000) | (i.target() << 2);
    cpu.branch(target);
}

pub fn jal(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(31, cpu.regs.npc);
    j(cpu, i);
}

pub fn jr(cpu: &mut Cpu, i: Instruction) {
    let target = cpu.read_reg(i.rs());
    cpu.branch(target);
}

pub fn jalr(cpu: &mut Cpu, i: Instruction) {
    let target = cpu.read_reg(i.rs());
    cpu.write_reg(i.rd(), cpu.regs.npc);
    cpu.branch(target);
}

pub fn beq(cpu: &mut Cpu, i: Instruction) {
    if cpu.read_reg(i.rs()) == cpu.read_reg(i.rt()) {
        cpu.branch(relative_target(cpu, i));
    }
}

pub fn bne(cpu: &mut Cpu, i: Instruction) {
    if cpu.read_reg(i.rs()) != cpu.read_reg(i.rt()) {
        cpu.branch(relative_target(cpu, i));
    }
}

pub fn blez(cpu: &mut Cpu, i: Instruction) {
    if cpu.read_reg(i.rs()) as i32 <= 0 {
        cpu.branch(relative_target(cpu, i));
    }
}

pub fn bgtz(cpu: &mut Cpu, i: Instruction) {
    if cpu.read_reg(i.rs()) as i32 > 0 {
        cpu.branch(relative_target(cpu, i));
    }
}

/// BLTZ/BGEZ/BLTZAL/BGEZAL. Every rt value decodes to one of these; bit 0
/// selects the condition and 0x10 in bits 1-4 selects linking. The link
/// register is written even when the branch is not taken.
pub fn bcondz(cpu: &mut Cpu, i: Instruction) {
    let ge = i.rt() & 1 != 0;
    let link = i.rt() & 0x1E == 0x10;
    let negative = (cpu.read_reg(i.rs()) as i32) < 0;
    let taken = negative != ge;

    if link {
        cpu.write_reg(31, cpu.regs.npc);
    }
    if taken {
        cpu.branch(relative_target(cpu, i));
    }
}
