//! Instruction interpreter
//!
//! Both the uncached interpreter and the cached interpreter funnel through
//! [`Cpu::execute_decoded`], so the two modes share one definition of every
//! instruction's semantics, including the delay slot and load delay pipeline.

use crate::cpu::Cpu;
use crate::decoder::{CpuDecoder, DecodedInstruction, Operation};
use crate::instructions::{branch, integer, load_store, system};
use px_memory::Bus;

impl Cpu {
    /// Service a pending interrupt, then execute one instruction
    pub fn step(&mut self, bus: &mut Bus) {
        if self.has_pending_interrupt() {
            self.dispatch_interrupt();
        }
        self.execute_instruction(bus);
    }

    /// Fetch, decode and execute the instruction at pc
    pub fn execute_instruction(&mut self, bus: &mut Bus) {
        self.begin_instruction();
        let Some(instruction) = self.fetch_instruction(bus) else {
            return;
        };
        let decoded = CpuDecoder::decode(instruction.0);
        self.retire(bus, &decoded);
    }

    /// Execute an already decoded instruction located at the current pc.
    /// Also used by recompiler backends for instructions they hand back to
    /// the interpreter.
    pub fn execute_decoded(&mut self, bus: &mut Bus, decoded: &DecodedInstruction) {
        self.begin_instruction();
        self.retire(bus, decoded);
    }

    fn begin_instruction(&mut self) {
        self.pending_ticks += 1;
        self.current_instruction_pc = self.regs.pc;
        self.current_instruction_in_branch_delay_slot = self.next_instruction_is_branch_delay_slot;
        self.current_instruction_was_branch_taken = self.branch_was_taken;
        self.next_instruction_is_branch_delay_slot = false;
        self.branch_was_taken = false;
        self.exception_raised = false;
    }

    fn retire(&mut self, bus: &mut Bus, decoded: &DecodedInstruction) {
        self.current_instruction = decoded.instruction;
        self.regs.pc = self.regs.npc;
        self.regs.npc = self.regs.npc.wrapping_add(4);

        self.dispatch(bus, decoded);
        self.update_load_delay();

        if decoded.is_branch() && !self.exception_raised {
            self.next_instruction_is_branch_delay_slot = true;
        }
    }

    fn dispatch(&mut self, bus: &mut Bus, decoded: &DecodedInstruction) {
        let i = decoded.instruction;
        match decoded.op {
            Operation::Sll => integer::sll(self, i),
            Operation::Srl => integer::srl(self, i),
            Operation::Sra => integer::sra(self, i),
            Operation::Sllv => integer::sllv(self, i),
            Operation::Srlv => integer::srlv(self, i),
            Operation::Srav => integer::srav(self, i),
            Operation::Jr => branch::jr(self, i),
            Operation::Jalr => branch::jalr(self, i),
            Operation::Syscall => system::syscall(self, i),
            Operation::Break => system::break_(self, i),
            Operation::Mfhi => integer::mfhi(self, i),
            Operation::Mthi => integer::mthi(self, i),
            Operation::Mflo => integer::mflo(self, i),
            Operation::Mtlo => integer::mtlo(self, i),
            Operation::Mult => integer::mult(self, i),
            Operation::Multu => integer::multu(self, i),
            Operation::Div => integer::div(self, i),
            Operation::Divu => integer::divu(self, i),
            Operation::Add => integer::add(self, i),
            Operation::Addu => integer::addu(self, i),
            Operation::Sub => integer::sub(self, i),
            Operation::Subu => integer::subu(self, i),
            Operation::And => integer::and(self, i),
            Operation::Or => integer::or(self, i),
            Operation::Xor => integer::xor(self, i),
            Operation::Nor => integer::nor(self, i),
            Operation::Slt => integer::slt(self, i),
            Operation::Sltu => integer::sltu(self, i),
            Operation::Bcondz => branch::bcondz(self, i),
            Operation::J => branch::j(self, i),
            Operation::Jal => branch::jal(self, i),
            Operation::Beq => branch::beq(self, i),
            Operation::Bne => branch::bne(self, i),
            Operation::Blez => branch::blez(self, i),
            Operation::Bgtz => branch::bgtz(self, i),
            Operation::Addi => integer::addi(self, i),
            Operation::Addiu => integer::addiu(self, i),
            Operation::Slti => integer::slti(self, i),
            Operation::Sltiu => integer::sltiu(self, i),
            Operation::Andi => integer::andi(self, i),
            Operation::Ori => integer::ori(self, i),
            Operation::Xori => integer::xori(self, i),
            Operation::Lui => integer::lui(self, i),
            Operation::Mfc0 => system::mfc0(self, i),
            Operation::Mtc0 => system::mtc0(self, i),
            Operation::Rfe => system::rfe(self, i),
            Operation::Mfc2 => system::mfc2(self, i),
            Operation::Cfc2 => system::cfc2(self, i),
            Operation::Mtc2 => system::mtc2(self, i),
            Operation::Ctc2 => system::ctc2(self, i),
            Operation::Gte => system::gte(self, i),
            Operation::CopUnusable => system::cop_unusable(self, i),
            Operation::Lb => load_store::lb(self, bus, i),
            Operation::Lh => load_store::lh(self, bus, i),
            Operation::Lwl => load_store::lwl(self, bus, i),
            Operation::Lw => load_store::lw(self, bus, i),
            Operation::Lbu => load_store::lbu(self, bus, i),
            Operation::Lhu => load_store::lhu(self, bus, i),
            Operation::Lwr => load_store::lwr(self, bus, i),
            Operation::Sb => load_store::sb(self, bus, i),
            Operation::Sh => load_store::sh(self, bus, i),
            Operation::Swl => load_store::swl(self, bus, i),
            Operation::Sw => load_store::sw(self, bus, i),
            Operation::Swr => load_store::swr(self, bus, i),
            Operation::Lwc2 => load_store::lwc2(self, bus, i),
            Operation::Swc2 => load_store::swc2(self, bus, i),
            Operation::Invalid => system::invalid(self, i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Exception;

    fn setup(program: &[u32]) -> (Cpu, Bus) {
        let mut bus = Bus::new(&[]).unwrap();
        for (n, word) in program.iter().enumerate() {
            bus.write_u32(0x8001_0000 + n as u32 * 4, *word).unwrap();
        }
        let mut cpu = Cpu::new(bus.interrupts().clone());
        cpu.set_pc(0x8001_0000);
        (cpu, bus)
    }

    #[test]
    fn test_branch_delay_slot_executes() {
        let (mut cpu, mut bus) = setup(&[
            0x1000_0002, // beq $zero, $zero, +2
            0x2408_0001, // addiu $t0, $zero, 1 (delay slot)
            0x2409_0002, // addiu $t1, $zero, 2 (skipped)
            0x240A_0003, // addiu $t2, $zero, 3
        ]);
        for _ in 0..3 {
            cpu.execute_instruction(&mut bus);
        }
        assert_eq!(cpu.read_reg(8), 1);
        assert_eq!(cpu.read_reg(9), 0);
        assert_eq!(cpu.read_reg(10), 3);
        assert_eq!(cpu.pc(), 0x8001_0010);
    }

    #[test]
    fn test_load_delay_slot() {
        let (mut cpu, mut bus) = setup(&[
            0x3C08_8001, // lui $t0, 0x8001
            0x8D09_0100, // lw $t1, 0x100($t0)
            0x0120_5021, // addu $t2, $t1, $zero (sees the old value)
            0x0120_5821, // addu $t3, $t1, $zero
        ]);
        bus.write_u32(0x8001_0100, 0xCAFE_BABE).unwrap();
        for _ in 0..4 {
            cpu.execute_instruction(&mut bus);
        }
        assert_eq!(cpu.read_reg(10), 0);
        assert_eq!(cpu.read_reg(11), 0xCAFE_BABE);
    }

    #[test]
    fn test_jal_links_past_delay_slot() {
        let (mut cpu, mut bus) = setup(&[
            0x0C00_4010, // jal 0x80010040
            0x0000_0000,
        ]);
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.read_reg(31), 0x8001_0008);
        assert_eq!(cpu.pc(), 0x8001_0040);
    }

    #[test]
    fn test_bltzal_links_when_not_taken() {
        let (mut cpu, mut bus) = setup(&[
            0x0410_0004, // bltzal $zero, +4
            0x0000_0000,
        ]);
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.read_reg(31), 0x8001_0008);
        assert_eq!(cpu.pc(), 0x8001_0008);
    }

    #[test]
    fn test_unaligned_load_merge() {
        let (mut cpu, mut bus) = setup(&[
            0x3C08_8001, // lui $t0, 0x8001
            0x8909_0103, // lwl $t1, 0x103($t0)
            0x9909_0100, // lwr $t1, 0x100($t0)
            0x0000_0000,
        ]);
        bus.write_u32(0x8001_0100, 0x4433_2211).unwrap();
        for _ in 0..4 {
            cpu.execute_instruction(&mut bus);
        }
        assert_eq!(cpu.read_reg(9), 0x4433_2211);
    }

    #[test]
    fn test_syscall_vector() {
        let (mut cpu, mut bus) = setup(&[0x0000_000C]);
        cpu.cop0.sr = 0;
        cpu.execute_instruction(&mut bus);
        assert!(cpu.exception_raised());
        assert_eq!(cpu.cop0.epc, 0x8001_0000);
        assert_eq!((cpu.cop0.cause >> 2) & 0x1F, Exception::Syscall as u32);
        assert_eq!(cpu.pc(), 0x8000_0080);
    }

    #[test]
    fn test_misaligned_fetch() {
        let (mut cpu, mut bus) = setup(&[]);
        cpu.set_pc(0x8001_0002);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.exception_raised());
        assert_eq!(cpu.cop0.bad_vaddr, 0x8001_0002);
    }
}
