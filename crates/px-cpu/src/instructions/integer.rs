//! Integer arithmetic instructions
//!
//! ALU, shift, multiply and divide instructions. Overflow-checking forms
//! raise an exception and leave the destination untouched.

use crate::cpu::{Cpu, Exception};
use crate::decoder::Instruction;

#[inline]
pub fn sll(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.read_reg(i.rt()) << i.shamt());
}

#[inline]
pub fn srl(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.read_reg(i.rt()) >> i.shamt());
}

#[inline]
pub fn sra(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), ((cpu.read_reg(i.rt()) as i32) >> i.shamt()) as u32);
}

#[inline]
pub fn sllv(cpu: &mut Cpu, i: Instruction) {
    let shift = cpu.read_reg(i.rs()) & 0x1F;
    cpu.write_reg(i.rd(), cpu.read_reg(i.rt()) << shift);
}

#[inline]
pub fn srlv(cpu: &mut Cpu, i: Instruction) {
    let shift = cpu.read_reg(i.rs()) & 0x1F;
    cpu.write_reg(i.rd(), cpu.read_reg(i.rt()) >> shift);
}

#[inline]
pub fn srav(cpu: &mut Cpu, i: Instruction) {
    let shift = cpu.read_reg(i.rs()) & 0x1F;
    cpu.write_reg(i.rd(), ((cpu.read_reg(i.rt()) as i32) >> shift) as u32);
}

pub fn mfhi(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.regs.hi);
}

pub fn mthi(cpu: &mut Cpu, i: Instruction) {
    cpu.regs.hi = cpu.read_reg(i.rs());
}

pub fn mflo(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.regs.lo);
}

pub fn mtlo(cpu: &mut Cpu, i: Instruction) {
    cpu.regs.lo = cpu.read_reg(i.rs());
}

pub fn mult(cpu: &mut Cpu, i: Instruction) {
    let a = cpu.read_reg(i.rs()) as i32 as i64;
    let b = cpu.read_reg(i.rt()) as i32 as i64;
    let product = (a * b) as u64;
    cpu.regs.hi = (product >> 32) as u32;
    cpu.regs.lo = product as u32;
}

pub fn multu(cpu: &mut Cpu, i: Instruction) {
    let product = cpu.read_reg(i.rs()) as u64 * cpu.read_reg(i.rt()) as u64;
    cpu.regs.hi = (product >> 32) as u32;
    cpu.regs.lo = product as u32;
}

pub fn div(cpu: &mut Cpu, i: Instruction) {
    let n = cpu.read_reg(i.rs()) as i32;
    let d = cpu.read_reg(i.rt()) as i32;

    if d == 0 {
        cpu.regs.hi = n as u32;
        cpu.regs.lo = if n >= 0 { 0xFFFF_FFFF } else { 1 };
    } else if n as u32 == 0x8000_0000 && d == -1 {
        cpu.regs.hi = 0;
        cpu.regs.lo = 0x8000_0000;
    } else {
        cpu.regs.hi = (n % d) as u32;
        cpu.regs.lo = (n / d) as u32;
    }
}

pub fn divu(cpu: &mut Cpu, i: Instruction) {
    let n = cpu.read_reg(i.rs());
    let d = cpu.read_reg(i.rt());

    if d == 0 {
        cpu.regs.hi = n;
        cpu.regs.lo = 0xFFFF_FFFF;
    } else {
        cpu.regs.hi = n % d;
        cpu.regs.lo = n / d;
    }
}

pub fn add(cpu: &mut Cpu, i: Instruction) {
    let a = cpu.read_reg(i.rs()) as i32;
    let b = cpu.read_reg(i.rt()) as i32;
    match a.checked_add(b) {
        Some(v) => cpu.write_reg(i.rd(), v as u32),
        None => cpu.raise_exception(Exception::Overflow),
    }
}

#[inline]
pub fn addu(cpu: &mut Cpu, i: Instruction) {
    let v = cpu.read_reg(i.rs()).wrapping_add(cpu.read_reg(i.rt()));
    cpu.write_reg(i.rd(), v);
}

pub fn sub(cpu: &mut Cpu, i: Instruction) {
    let a = cpu.read_reg(i.rs()) as i32;
    let b = cpu.read_reg(i.rt()) as i32;
    match a.checked_sub(b) {
        Some(v) => cpu.write_reg(i.rd(), v as u32),
        None => cpu.raise_exception(Exception::Overflow),
    }
}

#[inline]
pub fn subu(cpu: &mut Cpu, i: Instruction) {
    let v = cpu.read_reg(i.rs()).wrapping_sub(cpu.read_reg(i.rt()));
    cpu.write_reg(i.rd(), v);
}

#[inline]
pub fn and(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.read_reg(i.rs()) & cpu.read_reg(i.rt()));
}

#[inline]
pub fn or(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.read_reg(i.rs()) | cpu.read_reg(i.rt()));
}

#[inline]
pub fn xor(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), cpu.read_reg(i.rs()) ^ cpu.read_reg(i.rt()));
}

#[inline]
pub fn nor(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rd(), !(cpu.read_reg(i.rs()) | cpu.read_reg(i.rt())));
}

pub fn slt(cpu: &mut Cpu, i: Instruction) {
    let v = (cpu.read_reg(i.rs()) as i32) < (cpu.read_reg(i.rt()) as i32);
    cpu.write_reg(i.rd(), v as u32);
}

pub fn sltu(cpu: &mut Cpu, i: Instruction) {
    let v = cpu.read_reg(i.rs()) < cpu.read_reg(i.rt());
    cpu.write_reg(i.rd(), v as u32);
}

pub fn addi(cpu: &mut Cpu, i: Instruction) {
    let a = cpu.read_reg(i.rs()) as i32;
    match a.checked_add(i.simm16() as i32) {
        Some(v) => cpu.write_reg(i.rt(), v as u32),
        None => cpu.raise_exception(Exception::Overflow),
    }
}

#[inline]
pub fn addiu(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rt(), cpu.read_reg(i.rs()).wrapping_add(i.simm16()));
}

pub fn slti(cpu: &mut Cpu, i: Instruction) {
    let v = (cpu.read_reg(i.rs()) as i32) < (i.simm16() as i32);
    cpu.write_reg(i.rt(), v as u32);
}

pub fn sltiu(cpu: &mut Cpu, i: Instruction) {
    let v = cpu.read_reg(i.rs()) < i.simm16();
    cpu.write_reg(i.rt(), v as u32);
}

#[inline]
pub fn andi(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rt(), cpu.read_reg(i.rs()) & i.imm16());
}

#[inline]
pub fn ori(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rt(), cpu.read_reg(i.rs()) | i.imm16());
}

#[inline]
pub fn xori(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rt(), cpu.read_reg(i.rs()) ^ i.imm16());
}

#[inline]
pub fn lui(cpu: &mut Cpu, i: Instruction) {
    cpu.write_reg(i.rt(), i.imm16() << 16);
}
