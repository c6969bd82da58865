//! Load and store instructions
//!
//! Loads into GPRs go through the load delay slot. LWL/LWR merge with the
//! value of a load still in flight to the same register.

use crate::cpu::{sr, Cpu, Exception};
use crate::decoder::Instruction;
use px_memory::{AccessSize, Bus};

#[inline]
fn effective_address(cpu: &Cpu, i: Instruction) -> u32 {
    cpu.read_reg(i.rs()).wrapping_add(i.simm16())
}

pub fn lb(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::Byte) {
        cpu.write_reg_delayed(i.rt(), v as u8 as i8 as i32 as u32);
    }
}

pub fn lbu(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::Byte) {
        cpu.write_reg_delayed(i.rt(), v & 0xFF);
    }
}

pub fn lh(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::HalfWord) {
        cpu.write_reg_delayed(i.rt(), v as u16 as i16 as i32 as u32);
    }
}

pub fn lhu(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::HalfWord) {
        cpu.write_reg_delayed(i.rt(), v & 0xFFFF);
    }
}

pub fn lw(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::Word) {
        cpu.write_reg_delayed(i.rt(), v);
    }
}

pub fn lwl(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let Some(word) = cpu.read_memory(bus, addr & !3, AccessSize::Word) else {
        return;
    };

    let current = cpu.read_reg_for_merge(i.rt());
    let value = match addr & 3 {
        0 => (current & 0x00FF_FFFF) | (word << 24),
        1 => (current & 0x0000_FFFF) | (word << 16),
        2 => (current & 0x0000_00FF) | (word << 8),
        _ => word,
    };
    cpu.write_reg_delayed(i.rt(), value);
}

pub fn lwr(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let Some(word) = cpu.read_memory(bus, addr & !3, AccessSize::Word) else {
        return;
    };

    let current = cpu.read_reg_for_merge(i.rt());
    let value = match addr & 3 {
        0 => word,
        1 => (current & 0xFF00_0000) | (word >> 8),
        2 => (current & 0xFFFF_0000) | (word >> 16),
        _ => (current & 0xFFFF_FF00) | (word >> 24),
    };
    cpu.write_reg_delayed(i.rt(), value);
}

pub fn sb(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let value = cpu.read_reg(i.rt()) & 0xFF;
    cpu.write_memory(bus, addr, value, AccessSize::Byte);
}

pub fn sh(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let value = cpu.read_reg(i.rt()) & 0xFFFF;
    cpu.write_memory(bus, addr, value, AccessSize::HalfWord);
}

pub fn sw(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let value = cpu.read_reg(i.rt());
    cpu.write_memory(bus, addr, value, AccessSize::Word);
}

pub fn swl(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let aligned = addr & !3;
    let Some(mem) = cpu.read_memory(bus, aligned, AccessSize::Word) else {
        return;
    };

    let v = cpu.read_reg(i.rt());
    let value = match addr & 3 {
        0 => (mem & 0xFFFF_FF00) | (v >> 24),
        1 => (mem & 0xFFFF_0000) | (v >> 16),
        2 => (mem & 0xFF00_0000) | (v >> 8),
        _ => v,
    };
    cpu.write_memory(bus, aligned, value, AccessSize::Word);
}

pub fn swr(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    let addr = effective_address(cpu, i);
    let aligned = addr & !3;
    let Some(mem) = cpu.read_memory(bus, aligned, AccessSize::Word) else {
        return;
    };

    let v = cpu.read_reg(i.rt());
    let value = match addr & 3 {
        0 => v,
        1 => (mem & 0x0000_00FF) | (v << 8),
        2 => (mem & 0x0000_FFFF) | (v << 16),
        _ => (mem & 0x00FF_FFFF) | (v << 24),
    };
    cpu.write_memory(bus, aligned, value, AccessSize::Word);
}

fn gte_enabled(cpu: &mut Cpu) -> bool {
    if cpu.cop0.sr & sr::CU2 == 0 {
        cpu.raise_exception_with_cop(Exception::CoprocessorUnusable, 2);
        return false;
    }
    true
}

pub fn lwc2(cpu: &mut Cpu, bus: &Bus, i: Instruction) {
    if !gte_enabled(cpu) {
        return;
    }
    let addr = effective_address(cpu, i);
    if let Some(v) = cpu.read_memory(bus, addr, AccessSize::Word) {
        cpu.gte.data[i.rt()] = v;
    }
}

pub fn swc2(cpu: &mut Cpu, bus: &mut Bus, i: Instruction) {
    if !gte_enabled(cpu) {
        return;
    }
    let addr = effective_address(cpu, i);
    let value = cpu.gte.data[i.rt()];
    cpu.write_memory(bus, addr, value, AccessSize::Word);
}
