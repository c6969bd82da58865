//! Code blocks
//!
//! A block is the unit the code cache stores: a run of decoded guest
//! instructions starting at a key's pc and ending after a branch delay slot,
//! an exit instruction, or the last fetchable word.

use crate::cpu::Cpu;
use crate::decoder::{CpuDecoder, DecodedInstruction};
use bitflags::bitflags;
use px_memory::{physical_address, Bus, RAM_CODE_PAGE_COUNT, RAM_CODE_PAGE_SHIFT, RAM_MASK, RAM_MIRROR_END};

/// Cache identity of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockKey {
    pub pc: u32,
    pub user_mode: bool,
}

impl CodeBlockKey {
    pub fn new(pc: u32, user_mode: bool) -> Self {
        Self { pc, user_mode }
    }

    /// Key of the block the CPU would execute next
    #[inline]
    pub fn for_cpu(cpu: &Cpu) -> Self {
        Self::new(cpu.regs.pc, cpu.in_user_mode())
    }
}

bitflags! {
    /// Per-instruction properties computed at compile time
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstructionFlags: u8 {
        const BRANCH = 1 << 0;
        const LOAD = 1 << 1;
        const STORE = 1 << 2;
        const BRANCH_DELAY_SLOT = 1 << 3;
        const LOAD_DELAY_SLOT = 1 << 4;
        const HAS_LOAD_DELAY = 1 << 5;
        const CAN_TRAP = 1 << 6;
        const LAST = 1 << 7;
    }
}

/// One decoded instruction of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlockInstruction {
    pub pc: u32,
    pub decoded: DecodedInstruction,
    pub flags: InstructionFlags,
}

impl CodeBlockInstruction {
    #[inline]
    pub fn word(&self) -> u32 {
        self.decoded.bits()
    }

    #[inline]
    pub fn is_branch(&self) -> bool {
        self.flags.contains(InstructionFlags::BRANCH)
    }

    #[inline]
    pub fn is_branch_delay_slot(&self) -> bool {
        self.flags.contains(InstructionFlags::BRANCH_DELAY_SLOT)
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags.contains(InstructionFlags::LAST)
    }
}

/// Stable handle of a block in the cache arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Native code produced for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCode {
    /// Entry point inside the code buffer
    pub entry: usize,
    /// Bytes emitted, near and far code together
    pub size: usize,
}

/// A cached block of guest code
#[derive(Debug)]
pub struct CodeBlock {
    pub key: CodeBlockKey,
    pub instructions: Vec<CodeBlockInstruction>,
    pub host_code: Option<HostCode>,
    pub invalidated: bool,
    /// Blocks execution has fallen through to from this one
    pub link_successors: Vec<BlockId>,
    /// Blocks that list this one as a successor
    pub link_predecessors: Vec<BlockId>,
}

impl CodeBlock {
    pub fn new(key: CodeBlockKey, instructions: Vec<CodeBlockInstruction>) -> Self {
        Self {
            key,
            instructions,
            host_code: None,
            invalidated: false,
            link_successors: Vec::new(),
            link_predecessors: Vec::new(),
        }
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.key.pc
    }

    /// Number of instructions
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Whether the block's code lives in main RAM and so can be overwritten
    pub fn in_ram(&self) -> bool {
        physical_address(self.key.pc) < RAM_MIRROR_END
    }

    /// RAM code pages covered by the block, in address order. Blocks running
    /// off the end of RAM wrap to the first page like the mirrors do.
    pub fn ram_pages(&self) -> impl Iterator<Item = usize> {
        let (first, last) = if self.in_ram() && !self.is_empty() {
            let start = physical_address(self.key.pc) & RAM_MASK;
            let end = start + (self.len() as u32 - 1) * 4;
            (
                (start >> RAM_CODE_PAGE_SHIFT) as usize,
                (end >> RAM_CODE_PAGE_SHIFT) as usize + 1,
            )
        } else {
            (0, 0)
        };
        (first..last).map(|page| page % RAM_CODE_PAGE_COUNT)
    }

    /// Compare the decoded words with what memory holds now
    pub fn matches_memory(&self, bus: &Bus) -> bool {
        self.instructions
            .iter()
            .all(|inst| bus.fetch_instruction(inst.pc) == Some(inst.word()))
    }
}

/// Decode the instructions of the block at `key`.
///
/// Stops after a non-branch delay slot, after an exit or invalid instruction, or
/// at the first address that can't be fetched. The result is empty when the
/// very first fetch fails.
pub fn decode_block(bus: &Bus, key: CodeBlockKey) -> Vec<CodeBlockInstruction> {
    let mut instructions = Vec::new();
    let mut pc = key.pc;
    let mut in_branch_delay_slot = false;
    let mut in_load_delay_slot = false;

    loop {
        if pc & 3 != 0 || (key.user_mode && pc >= 0x8000_0000) || !bus.is_cacheable(pc) {
            break;
        }
        let Some(word) = bus.fetch_instruction(pc) else {
            break;
        };

        let decoded = CpuDecoder::decode(word);
        let mut flags = InstructionFlags::empty();
        flags.set(InstructionFlags::BRANCH, decoded.is_branch());
        flags.set(InstructionFlags::LOAD, decoded.is_load());
        flags.set(InstructionFlags::STORE, decoded.is_store());
        flags.set(InstructionFlags::HAS_LOAD_DELAY, decoded.has_load_delay());
        flags.set(InstructionFlags::CAN_TRAP, decoded.can_trap(key.user_mode));
        flags.set(InstructionFlags::BRANCH_DELAY_SLOT, in_branch_delay_slot);
        flags.set(InstructionFlags::LOAD_DELAY_SLOT, in_load_delay_slot);

        instructions.push(CodeBlockInstruction { pc, decoded, flags });
        pc = pc.wrapping_add(4);

        // A branch in a delay slot keeps the block going until its own slot
        if (in_branch_delay_slot && !decoded.is_branch())
            || decoded.is_exit_block()
            || decoded.is_invalid()
        {
            break;
        }

        in_branch_delay_slot = decoded.is_branch();
        in_load_delay_slot = decoded.has_load_delay();
    }

    if let Some(last) = instructions.last_mut() {
        last.flags.insert(InstructionFlags::LAST);
    }

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with(addr: u32, program: &[u32]) -> Bus {
        let mut bus = Bus::new(&[]).unwrap();
        for (n, word) in program.iter().enumerate() {
            bus.write_u32(addr + n as u32 * 4, *word).unwrap();
        }
        bus
    }

    #[test]
    fn test_block_ends_after_delay_slot() {
        let bus = bus_with(
            0x8000_1000,
            &[
                0x2408_0001, // addiu $t0, $zero, 1
                0x8D09_0000, // lw $t1, 0($t0)
                0x1000_FFFD, // beq $zero, $zero, -3
                0x0000_0000, // nop (delay slot)
                0x2408_0002, // not part of the block
            ],
        );
        let insts = decode_block(&bus, CodeBlockKey::new(0x8000_1000, false));
        assert_eq!(insts.len(), 4);
        assert!(insts[2].is_branch());
        assert!(insts[3].is_branch_delay_slot());
        assert!(insts[3].is_last());
        assert!(insts[2].flags.contains(InstructionFlags::LOAD_DELAY_SLOT));
        assert!(insts[1].flags.contains(InstructionFlags::LOAD | InstructionFlags::CAN_TRAP));
    }

    #[test]
    fn test_branch_in_delay_slot_continues() {
        let bus = bus_with(
            0x8000_3000,
            &[
                0x1000_0004, // beq $zero, $zero, +4
                0x0800_0C40, // j 0x80003100 (in the delay slot)
                0x0000_0000, // delay slot of the jump
                0x0000_0000,
            ],
        );
        let insts = decode_block(&bus, CodeBlockKey::new(0x8000_3000, false));
        assert_eq!(insts.len(), 3);
        assert!(insts[1].is_branch() && insts[1].is_branch_delay_slot());
        assert!(insts[2].is_last());
    }

    #[test]
    fn test_block_ends_at_syscall() {
        let bus = bus_with(0x8000_2000, &[0x0000_0000, 0x0000_000C, 0x0000_0000]);
        let insts = decode_block(&bus, CodeBlockKey::new(0x8000_2000, false));
        assert_eq!(insts.len(), 2);
        assert!(insts[1].is_last());
    }

    #[test]
    fn test_uncacheable_start_is_empty() {
        let bus = bus_with(0x8000_0000, &[]);
        assert!(decode_block(&bus, CodeBlockKey::new(0x1F80_1000, false)).is_empty());
        assert!(decode_block(&bus, CodeBlockKey::new(0x8000_0002, false)).is_empty());
    }

    #[test]
    fn test_ram_pages_span_and_wrap() {
        let bus = bus_with(0x8000_0FF8, &[0, 0, 0x1000_0000, 0]);
        let block = CodeBlock::new(
            CodeBlockKey::new(0x8000_0FF8, false),
            decode_block(&bus, CodeBlockKey::new(0x8000_0FF8, false)),
        );
        assert_eq!(block.ram_pages().collect::<Vec<_>>(), vec![0, 1]);

        let bus = bus_with(0x801F_FFF8, &[0, 0, 0x1000_0000, 0]);
        let key = CodeBlockKey::new(0x801F_FFF8, false);
        let block = CodeBlock::new(key, decode_block(&bus, key));
        assert_eq!(block.len(), 4);
        assert_eq!(
            block.ram_pages().collect::<Vec<_>>(),
            vec![RAM_CODE_PAGE_COUNT - 1, 0]
        );
    }

    #[test]
    fn test_bios_block_has_no_ram_pages() {
        let mut bios = vec![0u8; 16];
        bios[4..8].copy_from_slice(&0x0000_000Cu32.to_le_bytes());
        let bus = Bus::new(&bios).unwrap();
        let key = CodeBlockKey::new(0xBFC0_0000, false);
        let block = CodeBlock::new(key, decode_block(&bus, key));
        assert_eq!(block.len(), 2);
        assert!(!block.in_ram());
        assert_eq!(block.ram_pages().count(), 0);
    }
}
