//! CPU core state

use crate::decoder::Instruction;
use px_memory::{physical_address, AccessSize, Bus, InterruptController, RESET_VECTOR};
use std::sync::Arc;

/// General purpose register file
#[derive(Debug, Clone)]
pub struct CpuRegisters {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    /// Address of the next instruction to execute
    pub pc: u32,
    /// Address of the instruction after that (branch target after a taken branch)
    pub npc: u32,
}

impl Default for CpuRegisters {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            pc: RESET_VECTOR,
            npc: RESET_VECTOR + 4,
        }
    }
}

/// COP0 register indices
pub mod cop0 {
    pub const BPC: usize = 3;
    pub const BDA: usize = 5;
    pub const JUMPDEST: usize = 6;
    pub const DCIC: usize = 7;
    pub const BAD_VADDR: usize = 8;
    pub const BDAM: usize = 9;
    pub const BPCM: usize = 11;
    pub const SR: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
}

/// Status register bits
pub mod sr {
    pub const IEC: u32 = 1 << 0;
    pub const KUC: u32 = 1 << 1;
    pub const IM_SHIFT: u32 = 8;
    pub const ISC: u32 = 1 << 16;
    pub const BEV: u32 = 1 << 22;
    pub const CU0: u32 = 1 << 28;
    pub const CU2: u32 = 1 << 30;
}

/// Exception codes written to CAUSE.Excode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Exception {
    Interrupt = 0x00,
    AddressErrorLoad = 0x04,
    AddressErrorStore = 0x05,
    InstructionBusError = 0x06,
    DataBusError = 0x07,
    Syscall = 0x08,
    Breakpoint = 0x09,
    ReservedInstruction = 0x0A,
    CoprocessorUnusable = 0x0B,
    Overflow = 0x0C,
}

/// System control coprocessor
#[derive(Debug, Clone)]
pub struct Cop0Registers {
    pub bpc: u32,
    pub bda: u32,
    pub jumpdest: u32,
    pub dcic: u32,
    pub bad_vaddr: u32,
    pub bdam: u32,
    pub bpcm: u32,
    pub sr: u32,
    /// CAUSE without the hardware interrupt bit, which is sampled live
    pub cause: u32,
    pub epc: u32,
}

impl Default for Cop0Registers {
    fn default() -> Self {
        Self {
            bpc: 0,
            bda: 0,
            jumpdest: 0,
            dcic: 0,
            bad_vaddr: 0,
            bdam: 0,
            bpcm: 0,
            sr: sr::BEV,
            cause: 0,
            epc: 0,
        }
    }
}

/// Processor ID of the R3000A
pub const PRID_VALUE: u32 = 0x0000_0002;

/// GTE register file. Only register moves are emulated.
#[derive(Debug, Clone, Default)]
pub struct GteRegisters {
    pub data: [u32; 32],
    pub control: [u32; 32],
}

/// The R3000A core
pub struct Cpu {
    pub regs: CpuRegisters,
    pub cop0: Cop0Registers,
    pub gte: GteRegisters,

    /// Cycles executed since the last event
    pub pending_ticks: u64,
    /// Cycle count at which control returns to the scheduler
    pub downcount: u64,

    pub(crate) current_instruction: Instruction,
    pub(crate) current_instruction_pc: u32,
    pub(crate) current_instruction_in_branch_delay_slot: bool,
    pub(crate) current_instruction_was_branch_taken: bool,
    pub(crate) next_instruction_is_branch_delay_slot: bool,
    pub(crate) branch_was_taken: bool,
    pub(crate) exception_raised: bool,

    load_delay_reg: Option<usize>,
    load_delay_value: u32,
    next_load_delay_reg: Option<usize>,
    next_load_delay_value: u32,

    interrupts: Arc<InterruptController>,
}

impl Cpu {
    pub fn new(interrupts: Arc<InterruptController>) -> Self {
        Self {
            regs: CpuRegisters::default(),
            cop0: Cop0Registers::default(),
            gte: GteRegisters::default(),
            pending_ticks: 0,
            downcount: 0,
            current_instruction: Instruction(0),
            current_instruction_pc: RESET_VECTOR,
            current_instruction_in_branch_delay_slot: false,
            current_instruction_was_branch_taken: false,
            next_instruction_is_branch_delay_slot: false,
            branch_was_taken: false,
            exception_raised: false,
            load_delay_reg: None,
            load_delay_value: 0,
            next_load_delay_reg: None,
            next_load_delay_value: 0,
            interrupts,
        }
    }

    /// Return to the power-on state
    pub fn reset(&mut self) {
        let interrupts = Arc::clone(&self.interrupts);
        *self = Self::new(interrupts);
        tracing::debug!("CPU reset, pc=0x{:08x}", self.regs.pc);
    }

    /// Jump to `pc` with a clean pipeline
    pub fn set_pc(&mut self, pc: u32) {
        self.regs.pc = pc;
        self.regs.npc = pc.wrapping_add(4);
        self.next_instruction_is_branch_delay_slot = false;
        self.branch_was_taken = false;
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.regs.pc
    }

    /// Kernel/user mode (SR.KUc set means user)
    #[inline]
    pub fn in_user_mode(&self) -> bool {
        self.cop0.sr & sr::KUC != 0
    }

    /// Stores are redirected to the instruction cache
    #[inline]
    pub fn is_cache_isolated(&self) -> bool {
        self.cop0.sr & sr::ISC != 0
    }

    /// Whether the instruction after the last executed one is a delay slot
    #[inline]
    pub fn in_branch_delay_slot(&self) -> bool {
        self.next_instruction_is_branch_delay_slot
    }

    /// Live CAUSE value, including the hardware interrupt line on IP2
    pub fn cause(&self) -> u32 {
        let hw = if self.interrupts.line() { 1 << 10 } else { 0 };
        (self.cop0.cause & !(1 << 10)) | hw
    }

    /// An enabled interrupt is waiting
    pub fn has_pending_interrupt(&self) -> bool {
        let im = (self.cop0.sr >> sr::IM_SHIFT) & 0xFF;
        let ip = (self.cause() >> 8) & 0xFF;
        self.cop0.sr & sr::IEC != 0 && im & ip != 0
    }

    /// Take the pending interrupt before the instruction at pc
    pub fn dispatch_interrupt(&mut self) {
        self.current_instruction_pc = self.regs.pc;
        self.current_instruction_in_branch_delay_slot = self.next_instruction_is_branch_delay_slot;
        self.current_instruction_was_branch_taken = self.branch_was_taken;
        self.raise_exception(Exception::Interrupt);
    }

    #[inline]
    pub fn exception_raised(&self) -> bool {
        self.exception_raised
    }

    /// Enter the exception vector for the current instruction
    pub fn raise_exception(&mut self, exception: Exception) {
        self.raise_exception_with_cop(exception, 0);
    }

    pub(crate) fn raise_exception_with_cop(&mut self, exception: Exception, cop: u32) {
        let mut epc = self.current_instruction_pc;
        let mut cause = (self.cop0.cause & 0x300) | ((exception as u32) << 2) | ((cop & 3) << 28);
        if self.current_instruction_in_branch_delay_slot {
            epc = epc.wrapping_sub(4);
            cause |= 1 << 31;
            if self.current_instruction_was_branch_taken {
                cause |= 1 << 30;
            }
        }

        if exception != Exception::Interrupt {
            tracing::debug!(
                "Exception {:?} at 0x{:08x} (epc 0x{:08x})",
                exception,
                self.current_instruction_pc,
                epc
            );
        }

        self.cop0.epc = epc;
        self.cop0.cause = cause;
        // Push the interrupt enable / kernel mode stack
        self.cop0.sr = (self.cop0.sr & !0x3F) | ((self.cop0.sr << 2) & 0x3F);

        let vector = if self.cop0.sr & sr::BEV != 0 {
            0xBFC0_0180
        } else {
            0x8000_0080
        };
        self.regs.pc = vector;
        self.regs.npc = vector + 4;
        self.exception_raised = true;
        self.flush_pipeline();
    }

    /// Commit an in-flight load and drop branch state after an exception
    fn flush_pipeline(&mut self) {
        self.next_load_delay_reg = None;
        if let Some(reg) = self.load_delay_reg.take() {
            self.regs.gpr[reg] = self.load_delay_value;
        }
        self.next_instruction_is_branch_delay_slot = false;
        self.branch_was_taken = false;
    }

    /// Pop the mode stack
    pub fn return_from_exception(&mut self) {
        self.cop0.sr = (self.cop0.sr & !0x0F) | ((self.cop0.sr >> 2) & 0x0F);
    }

    #[inline]
    pub fn read_reg(&self, reg: usize) -> u32 {
        self.regs.gpr[reg]
    }

    /// Immediate register write. Cancels a pending load to the same register.
    #[inline]
    pub fn write_reg(&mut self, reg: usize, value: u32) {
        self.regs.gpr[reg] = value;
        self.regs.gpr[0] = 0;
        if self.load_delay_reg == Some(reg) {
            self.load_delay_reg = None;
        }
    }

    /// Register write that becomes visible after the next instruction
    #[inline]
    pub fn write_reg_delayed(&mut self, reg: usize, value: u32) {
        if reg == 0 {
            return;
        }
        if self.load_delay_reg == Some(reg) {
            self.load_delay_reg = None;
        }
        self.next_load_delay_reg = Some(reg);
        self.next_load_delay_value = value;
    }

    /// Value of `reg` as seen by LWL/LWR, which merge with an in-flight load
    #[inline]
    pub fn read_reg_for_merge(&self, reg: usize) -> u32 {
        if self.load_delay_reg == Some(reg) {
            self.load_delay_value
        } else {
            self.regs.gpr[reg]
        }
    }

    /// Retire the current load delay and shift the next one in
    #[inline]
    pub fn update_load_delay(&mut self) {
        if let Some(reg) = self.load_delay_reg {
            self.regs.gpr[reg] = self.load_delay_value;
        }
        self.load_delay_reg = self.next_load_delay_reg.take();
        self.load_delay_value = self.next_load_delay_value;
    }

    /// Branch to `target` after the delay slot
    #[inline]
    pub(crate) fn branch(&mut self, target: u32) {
        self.regs.npc = target;
        self.branch_was_taken = true;
    }

    /// Fetch the word at pc, raising the matching exception on failure
    pub(crate) fn fetch_instruction(&mut self, bus: &Bus) -> Option<Instruction> {
        let pc = self.regs.pc;
        if pc & 3 != 0 || (self.in_user_mode() && pc >= 0x8000_0000) {
            self.cop0.bad_vaddr = pc;
            self.raise_exception(Exception::AddressErrorLoad);
            return None;
        }

        match bus.fetch_instruction(pc) {
            Some(word) => Some(Instruction(word)),
            None => {
                self.raise_exception(Exception::InstructionBusError);
                None
            }
        }
    }

    fn check_data_address(&mut self, addr: u32, size: AccessSize, store: bool) -> bool {
        let misaligned = addr & (size.bytes() - 1) != 0;
        let privileged = self.in_user_mode() && addr >= 0x8000_0000;
        if misaligned || privileged {
            self.cop0.bad_vaddr = addr;
            self.raise_exception(if store {
                Exception::AddressErrorStore
            } else {
                Exception::AddressErrorLoad
            });
            return false;
        }
        true
    }

    /// Data read with alignment, privilege and bus error checks
    pub(crate) fn read_memory(&mut self, bus: &Bus, addr: u32, size: AccessSize) -> Option<u32> {
        if !self.check_data_address(addr, size, false) {
            return None;
        }
        match bus.read(addr, size) {
            Ok(value) => Some(value),
            Err(_) => {
                self.raise_exception(Exception::DataBusError);
                None
            }
        }
    }

    /// Data write. Stores with the cache isolated are discarded.
    pub(crate) fn write_memory(&mut self, bus: &mut Bus, addr: u32, value: u32, size: AccessSize) {
        if !self.check_data_address(addr, size, true) {
            return;
        }
        if self.is_cache_isolated() {
            tracing::trace!(
                "Dropping isolated store to 0x{:08x}",
                physical_address(addr)
            );
            return;
        }
        if bus.write(addr, value, size).is_err() {
            self.raise_exception(Exception::DataBusError);
        }
    }
}
