//! Guest physical memory bus

use crate::constants::*;
use crate::ram::Ram;
use parking_lot::Mutex;
use px_core::error::{AccessKind, MemoryError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Width of a bus access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    HalfWord,
    Word,
}

impl AccessSize {
    pub fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::HalfWord => 2,
            Self::Word => 4,
        }
    }
}

/// A memory mapped hardware block
pub trait IoDevice: Send {
    /// Read from `offset` relative to the device base
    fn read(&mut self, offset: u32, size: AccessSize) -> u32;

    /// Write to `offset` relative to the device base
    fn write(&mut self, offset: u32, value: u32, size: AccessSize);
}

/// Shared handle to an attached device
pub type SharedIoDevice = Arc<Mutex<dyn IoDevice>>;

struct IoMapping {
    base: u32,
    size: u32,
    name: &'static str,
    device: SharedIoDevice,
}

/// Interrupt sources wired into I_STAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Interrupt {
    VBlank = 0,
    Gpu = 1,
    CdRom = 2,
    Dma = 3,
    Timer0 = 4,
    Timer1 = 5,
    Timer2 = 6,
    Controller = 7,
    Sio = 8,
    Spu = 9,
    Lightpen = 10,
}

/// I_STAT / I_MASK pair. Devices raise lines from any thread.
#[derive(Debug, Default)]
pub struct InterruptController {
    status: AtomicU32,
    mask: AtomicU32,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch an interrupt request
    pub fn request(&self, irq: Interrupt) {
        self.status.fetch_or(1 << irq as u32, Ordering::AcqRel);
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire)
    }

    /// Writing I_STAT acknowledges the bits written as zero
    pub fn write_status(&self, value: u32) {
        self.status.fetch_and(value & 0x7FF, Ordering::AcqRel);
    }

    pub fn write_mask(&self, value: u32) {
        self.mask.store(value & 0x7FF, Ordering::Release);
    }

    /// Level of the CPU hardware interrupt line (COP0 cause bit 10)
    pub fn line(&self) -> bool {
        self.status() & self.mask() != 0
    }
}

/// The console's physical address space
pub struct Bus {
    ram: Arc<Ram>,
    bios: Box<[u8]>,
    scratchpad: Box<[u8]>,
    interrupts: Arc<InterruptController>,
    io: Vec<IoMapping>,
    cache_control: u32,
}

impl Bus {
    /// Create a bus with `bios` mapped at 0x1FC00000
    pub fn new(bios: &[u8]) -> Result<Self, MemoryError> {
        let mut rom = vec![0u8; BIOS_SIZE as usize].into_boxed_slice();
        let len = bios.len().min(rom.len());
        rom[..len].copy_from_slice(&bios[..len]);
        if bios.len() != BIOS_SIZE as usize {
            tracing::warn!(
                "BIOS image is {} bytes, expected {}",
                bios.len(),
                BIOS_SIZE
            );
        }

        Ok(Self {
            ram: Ram::new()?,
            bios: rom,
            scratchpad: vec![0u8; SCRATCHPAD_SIZE as usize].into_boxed_slice(),
            interrupts: Arc::new(InterruptController::new()),
            io: Vec::new(),
            cache_control: 0,
        })
    }

    pub fn ram(&self) -> &Arc<Ram> {
        &self.ram
    }

    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    /// Map a device at a physical address inside the I/O region
    pub fn attach(&mut self, name: &'static str, base: u32, size: u32, device: SharedIoDevice) {
        tracing::debug!("Attaching {} at 0x{:08x}..0x{:08x}", name, base, base + size);
        self.io.push(IoMapping {
            base,
            size,
            name,
            device,
        });
    }

    /// Whether instruction fetches from `addr` can be cached
    pub fn is_cacheable(&self, addr: u32) -> bool {
        let phys = physical_address(addr);
        phys < RAM_MIRROR_END || (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&phys)
    }

    /// Fetch an instruction word. Only RAM and BIOS hold code.
    pub fn fetch_instruction(&self, addr: u32) -> Option<u32> {
        let phys = physical_address(addr);
        if phys < RAM_MIRROR_END {
            Some(self.ram.read::<u32>(phys))
        } else if (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&phys) {
            Some(read_le(&self.bios, phys - BIOS_BASE, AccessSize::Word))
        } else {
            None
        }
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        self.read(addr, AccessSize::Byte).map(|v| v as u8)
    }

    pub fn read_u16(&self, addr: u32) -> Result<u16, MemoryError> {
        self.read(addr, AccessSize::HalfWord).map(|v| v as u16)
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.read(addr, AccessSize::Word)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write(addr, value as u32, AccessSize::Byte)
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write(addr, value as u32, AccessSize::HalfWord)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, value, AccessSize::Word)
    }

    /// Read `size` bytes at a virtual address
    pub fn read(&self, addr: u32, size: AccessSize) -> Result<u32, MemoryError> {
        let phys = physical_address(addr);

        if phys < RAM_MIRROR_END {
            return Ok(match size {
                AccessSize::Byte => self.ram.read::<u8>(phys) as u32,
                AccessSize::HalfWord => self.ram.read::<u16>(phys) as u32,
                AccessSize::Word => self.ram.read::<u32>(phys),
            });
        }

        if (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&phys) {
            return Ok(read_le(&self.bios, phys - BIOS_BASE, size));
        }

        if (SCRATCHPAD_BASE..SCRATCHPAD_BASE + SCRATCHPAD_SIZE).contains(&phys) {
            return Ok(read_le(&self.scratchpad, phys - SCRATCHPAD_BASE, size));
        }

        if (IO_BASE..IO_BASE + IO_SIZE).contains(&phys) {
            return Ok(self.read_io(phys, size));
        }

        if (EXP1_BASE..EXP1_BASE + EXP1_SIZE).contains(&phys) {
            return Ok(u32::MAX >> (32 - size.bytes() * 8));
        }

        if phys == CACHE_CONTROL_ADDR {
            return Ok(self.cache_control);
        }

        Err(MemoryError::AccessViolation {
            addr,
            kind: AccessKind::Read,
        })
    }

    /// Write `size` bytes at a virtual address
    pub fn write(&mut self, addr: u32, value: u32, size: AccessSize) -> Result<(), MemoryError> {
        let phys = physical_address(addr);

        if phys < RAM_MIRROR_END {
            match size {
                AccessSize::Byte => self.ram.write::<u8>(phys, value as u8),
                AccessSize::HalfWord => self.ram.write::<u16>(phys, value as u16),
                AccessSize::Word => self.ram.write::<u32>(phys, value),
            }
            return Ok(());
        }

        if (SCRATCHPAD_BASE..SCRATCHPAD_BASE + SCRATCHPAD_SIZE).contains(&phys) {
            write_le(&mut self.scratchpad, phys - SCRATCHPAD_BASE, value, size);
            return Ok(());
        }

        if (IO_BASE..IO_BASE + IO_SIZE).contains(&phys) {
            self.write_io(phys, value, size);
            return Ok(());
        }

        if (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&phys)
            || (EXP1_BASE..EXP1_BASE + EXP1_SIZE).contains(&phys)
        {
            tracing::trace!("Ignoring write of 0x{:08x} to ROM at 0x{:08x}", value, addr);
            return Ok(());
        }

        if phys == CACHE_CONTROL_ADDR {
            self.cache_control = value;
            return Ok(());
        }

        Err(MemoryError::AccessViolation {
            addr,
            kind: AccessKind::Write,
        })
    }

    fn read_io(&self, phys: u32, size: AccessSize) -> u32 {
        match phys & !3 {
            I_STAT_ADDR => return self.interrupts.status() >> ((phys & 3) * 8),
            I_MASK_ADDR => return self.interrupts.mask() >> ((phys & 3) * 8),
            _ => {}
        }

        if let Some(mapping) = self.find_io(phys) {
            return mapping.device.lock().read(phys - mapping.base, size);
        }

        tracing::trace!("Unhandled I/O read at 0x{:08x}", phys);
        0
    }

    fn write_io(&mut self, phys: u32, value: u32, size: AccessSize) {
        match phys & !3 {
            I_STAT_ADDR => return self.interrupts.write_status(value),
            I_MASK_ADDR => return self.interrupts.write_mask(value),
            _ => {}
        }

        if let Some(mapping) = self.find_io(phys) {
            mapping.device.lock().write(phys - mapping.base, value, size);
            return;
        }

        tracing::trace!("Unhandled I/O write of 0x{:08x} at 0x{:08x}", value, phys);
    }

    fn find_io(&self, phys: u32) -> Option<&IoMapping> {
        self.io
            .iter()
            .find(|m| phys >= m.base && phys < m.base + m.size)
    }

    /// Names of attached devices, for diagnostics
    pub fn devices(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.io.iter().map(|m| m.name)
    }

    // Code page bookkeeping used by the code cache

    pub fn set_ram_code_page(&self, page: usize) {
        self.ram.set_code_page(page);
    }

    pub fn clear_ram_code_page(&self, page: usize) {
        self.ram.clear_code_page(page);
    }

    pub fn is_ram_code_page(&self, page: usize) -> bool {
        self.ram.is_code_page(page)
    }

    pub fn clear_ram_code_page_flags(&self) {
        self.ram.clear_code_page_flags();
    }
}

fn read_le(mem: &[u8], offset: u32, size: AccessSize) -> u32 {
    let offset = offset as usize;
    match size {
        AccessSize::Byte => mem[offset] as u32,
        AccessSize::HalfWord => u16::from_le_bytes([mem[offset], mem[offset + 1]]) as u32,
        AccessSize::Word => u32::from_le_bytes([
            mem[offset],
            mem[offset + 1],
            mem[offset + 2],
            mem[offset + 3],
        ]),
    }
}

fn write_le(mem: &mut [u8], offset: u32, value: u32, size: AccessSize) {
    let offset = offset as usize;
    let bytes = value.to_le_bytes();
    let len = size.bytes() as usize;
    mem[offset..offset + len].copy_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch {
        last: u32,
    }

    impl IoDevice for Latch {
        fn read(&mut self, offset: u32, _size: AccessSize) -> u32 {
            self.last + offset
        }

        fn write(&mut self, _offset: u32, value: u32, _size: AccessSize) {
            self.last = value;
        }
    }

    fn bus() -> Bus {
        let mut bios = vec![0u8; BIOS_SIZE as usize];
        bios[0..4].copy_from_slice(&0x3C08_0013u32.to_le_bytes());
        Bus::new(&bios).unwrap()
    }

    #[test]
    fn test_ram_segments_alias() {
        let mut bus = bus();
        bus.write_u32(0x8000_0100, 0xCAFE_BABE).unwrap();
        assert_eq!(bus.read_u32(0x0000_0100).unwrap(), 0xCAFE_BABE);
        assert_eq!(bus.read_u32(0xA000_0100).unwrap(), 0xCAFE_BABE);
        assert_eq!(bus.read_u16(0x8060_0102).unwrap(), 0xCAFE);
    }

    #[test]
    fn test_bios_is_read_only() {
        let mut bus = bus();
        assert_eq!(bus.read_u32(RESET_VECTOR).unwrap(), 0x3C08_0013);
        bus.write_u32(RESET_VECTOR, 0).unwrap();
        assert_eq!(bus.fetch_instruction(RESET_VECTOR), Some(0x3C08_0013));
    }

    #[test]
    fn test_cacheable_regions() {
        let bus = bus();
        assert!(bus.is_cacheable(0x8001_0000));
        assert!(bus.is_cacheable(RESET_VECTOR));
        assert!(!bus.is_cacheable(0x1F80_0000));
        assert!(bus.fetch_instruction(0x1F80_1810).is_none());
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mut bus = bus();
        assert!(bus.read_u32(0x1E00_0000).is_err());
        assert!(matches!(
            bus.write_u32(0x1E00_0000, 0),
            Err(MemoryError::AccessViolation {
                kind: AccessKind::Write,
                ..
            })
        ));
    }

    #[test]
    fn test_interrupt_controller() {
        let mut bus = bus();
        let irq = bus.interrupts().clone();
        irq.request(Interrupt::VBlank);
        irq.request(Interrupt::Gpu);
        assert!(!irq.line());

        bus.write_u32(I_MASK_ADDR, 0x2).unwrap();
        assert!(irq.line());
        assert_eq!(bus.read_u32(I_STAT_ADDR).unwrap(), 0x3);

        bus.write_u32(I_STAT_ADDR, !0x2).unwrap();
        assert_eq!(bus.read_u32(I_STAT_ADDR).unwrap(), 0x1);
        assert!(!irq.line());
    }

    #[test]
    fn test_io_device_dispatch() {
        let mut bus = bus();
        let device: SharedIoDevice = Arc::new(Mutex::new(Latch { last: 0 }));
        bus.attach("latch", GPU_BASE, GPU_SIZE, device);
        bus.write_u32(GPU_BASE, 0x100).unwrap();
        assert_eq!(bus.read_u32(GPU_BASE + 4).unwrap(), 0x104);
        assert_eq!(bus.devices().collect::<Vec<_>>(), vec!["latch"]);
    }

    #[test]
    fn test_write_to_code_page_clears_flag() {
        let mut bus = bus();
        bus.set_ram_code_page(1);
        bus.write_u8(0x8000_1003, 0xFF).unwrap();
        assert!(!bus.is_ram_code_page(1));
        assert!(bus.ram().has_dirty_pages());
    }
}
