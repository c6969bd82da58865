//! System control and coprocessor instructions

use crate::cpu::{cop0, sr, Cpu, Exception, PRID_VALUE};
use crate::decoder::Instruction;
use std::sync::atomic::{AtomicBool, Ordering};

static GTE_COMMAND_WARNED: AtomicBool = AtomicBool::new(false);

pub fn syscall(cpu: &mut Cpu, _i: Instruction) {
    cpu.raise_exception(Exception::Syscall);
}

pub fn break_(cpu: &mut Cpu, _i: Instruction) {
    cpu.raise_exception(Exception::Breakpoint);
}

pub fn invalid(cpu: &mut Cpu, i: Instruction) {
    tracing::debug!(
        "Reserved instruction 0x{:08x} at 0x{:08x}",
        i.0,
        cpu.current_instruction_pc
    );
    cpu.raise_exception(Exception::ReservedInstruction);
}

/// COP1/COP3 and their load/store forms
pub fn cop_unusable(cpu: &mut Cpu, i: Instruction) {
    cpu.raise_exception_with_cop(Exception::CoprocessorUnusable, i.cop_index());
}

/// COP0 is always usable in kernel mode, and in user mode only with SR.CU0
fn cop0_usable(cpu: &mut Cpu) -> bool {
    if cpu.in_user_mode() && cpu.cop0.sr & sr::CU0 == 0 {
        cpu.raise_exception_with_cop(Exception::CoprocessorUnusable, 0);
        return false;
    }
    true
}

fn cop2_usable(cpu: &mut Cpu) -> bool {
    if cpu.cop0.sr & sr::CU2 == 0 {
        cpu.raise_exception_with_cop(Exception::CoprocessorUnusable, 2);
        return false;
    }
    true
}

/// Current value of a COP0 register. Unimplemented registers read as zero.
pub fn read_cop0(cpu: &Cpu, reg: usize) -> u32 {
    match reg {
        cop0::BPC => cpu.cop0.bpc,
        cop0::BDA => cpu.cop0.bda,
        cop0::JUMPDEST => cpu.cop0.jumpdest,
        cop0::DCIC => cpu.cop0.dcic,
        cop0::BAD_VADDR => cpu.cop0.bad_vaddr,
        cop0::BDAM => cpu.cop0.bdam,
        cop0::BPCM => cpu.cop0.bpcm,
        cop0::SR => cpu.cop0.sr,
        cop0::CAUSE => cpu.cause(),
        cop0::EPC => cpu.cop0.epc,
        cop0::PRID => PRID_VALUE,
        _ => {
            tracing::trace!("Read of unknown COP0 register {}", reg);
            0
        }
    }
}

pub fn write_cop0(cpu: &mut Cpu, reg: usize, value: u32) {
    match reg {
        cop0::BPC => cpu.cop0.bpc = value,
        cop0::BDA => cpu.cop0.bda = value,
        cop0::JUMPDEST => cpu.cop0.jumpdest = value,
        cop0::DCIC => cpu.cop0.dcic = value,
        cop0::BDAM => cpu.cop0.bdam = value,
        cop0::BPCM => cpu.cop0.bpcm = value,
        cop0::SR => {
            let isolated = cpu.is_cache_isolated();
            cpu.cop0.sr = value;
            if isolated != cpu.is_cache_isolated() {
                tracing::trace!(
                    "Cache isolation {}",
                    if isolated { "off" } else { "on" }
                );
            }
        }
        // Only the software interrupt bits are writable
        cop0::CAUSE => cpu.cop0.cause = (cpu.cop0.cause & !0x300) | (value & 0x300),
        _ => tracing::trace!("Write 0x{:08x} to read-only COP0 register {}", value, reg),
    }
}

pub fn mfc0(cpu: &mut Cpu, i: Instruction) {
    if !cop0_usable(cpu) {
        return;
    }
    let value = read_cop0(cpu, i.rd());
    cpu.write_reg_delayed(i.rt(), value);
}

pub fn mtc0(cpu: &mut Cpu, i: Instruction) {
    if !cop0_usable(cpu) {
        return;
    }
    let value = cpu.read_reg(i.rt());
    write_cop0(cpu, i.rd(), value);
}

pub fn rfe(cpu: &mut Cpu, _i: Instruction) {
    if !cop0_usable(cpu) {
        return;
    }
    cpu.return_from_exception();
}

pub fn mfc2(cpu: &mut Cpu, i: Instruction) {
    if !cop2_usable(cpu) {
        return;
    }
    let value = cpu.gte.data[i.rd()];
    cpu.write_reg_delayed(i.rt(), value);
}

pub fn cfc2(cpu: &mut Cpu, i: Instruction) {
    if !cop2_usable(cpu) {
        return;
    }
    let value = cpu.gte.control[i.rd()];
    cpu.write_reg_delayed(i.rt(), value);
}

pub fn mtc2(cpu: &mut Cpu, i: Instruction) {
    if !cop2_usable(cpu) {
        return;
    }
    cpu.gte.data[i.rd()] = cpu.read_reg(i.rt());
}

pub fn ctc2(cpu: &mut Cpu, i: Instruction) {
    if !cop2_usable(cpu) {
        return;
    }
    cpu.gte.control[i.rd()] = cpu.read_reg(i.rt());
}

/// GTE operations are not emulated; the command is accepted and ignored.
pub fn gte(cpu: &mut Cpu, i: Instruction) {
    if !cop2_usable(cpu) {
        return;
    }
    if !GTE_COMMAND_WARNED.swap(true, Ordering::Relaxed) {
        tracing::warn!("GTE command 0x{:02x} ignored", i.0 & 0x3F);
    }
}
