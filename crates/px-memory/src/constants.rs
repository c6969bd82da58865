//! Physical memory map of the console

/// Main RAM size (2 MiB)
pub const RAM_SIZE: u32 = 0x20_0000;
/// Mask applied to mirrored RAM addresses
pub const RAM_MASK: u32 = RAM_SIZE - 1;
/// RAM is mirrored four times across the first 8 MiB
pub const RAM_MIRROR_END: u32 = 0x80_0000;

/// Granularity of code tracking in RAM
pub const RAM_CODE_PAGE_SHIFT: u32 = 12;
pub const RAM_CODE_PAGE_SIZE: u32 = 1 << RAM_CODE_PAGE_SHIFT;
pub const RAM_CODE_PAGE_COUNT: usize = (RAM_SIZE / RAM_CODE_PAGE_SIZE) as usize;

/// Expansion region 1 (parallel port), reads as open bus
pub const EXP1_BASE: u32 = 0x1F00_0000;
pub const EXP1_SIZE: u32 = 0x80_0000;

/// Data cache used as scratchpad
pub const SCRATCHPAD_BASE: u32 = 0x1F80_0000;
pub const SCRATCHPAD_SIZE: u32 = 0x400;

/// Hardware registers
pub const IO_BASE: u32 = 0x1F80_1000;
pub const IO_SIZE: u32 = 0x2000;

/// Interrupt controller registers
pub const I_STAT_ADDR: u32 = 0x1F80_1070;
pub const I_MASK_ADDR: u32 = 0x1F80_1074;

/// GPU registers (GP0/GPUREAD at +0, GP1/GPUSTAT at +4)
pub const GPU_BASE: u32 = 0x1F80_1810;
pub const GPU_SIZE: u32 = 8;

/// BIOS ROM
pub const BIOS_BASE: u32 = 0x1FC0_0000;
pub const BIOS_SIZE: u32 = 0x8_0000;

/// KSEG2 cache control register
pub const CACHE_CONTROL_ADDR: u32 = 0xFFFE_0130;

/// Reset vector
pub const RESET_VECTOR: u32 = 0xBFC0_0000;

/// Translate a virtual address to a physical one. KSEG2 is not mirrored.
#[inline]
pub const fn physical_address(addr: u32) -> u32 {
    if addr >= 0xC000_0000 {
        addr
    } else {
        addr & 0x1FFF_FFFF
    }
}

/// Code page index for a physical RAM address
#[inline]
pub const fn ram_code_page_index(phys: u32) -> usize {
    ((phys & RAM_MASK) >> RAM_CODE_PAGE_SHIFT) as usize
}
