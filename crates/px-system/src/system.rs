//! Frame-stepped console

use crate::exe::{ExeHeader, EXE_HEADER_SIZE};
use parking_lot::Mutex;
use px_core::{Config, Result};
use px_cpu::{CodeCache, Cpu};
use px_gpu::Gpu;
use px_memory::{Bus, Interrupt, InterruptController, SharedIoDevice, GPU_BASE, GPU_SIZE};
use std::sync::Arc;

/// CPU ticks per NTSC frame (33.8688 MHz / 60)
pub const FRAME_TICKS_NTSC: u64 = 564_480;

/// CPU ticks per PAL frame (33.8688 MHz / 50)
pub const FRAME_TICKS_PAL: u64 = 677_376;

/// CPU ticks run between GPU catch-ups
const SLICE_TICKS: u64 = 2048;

const REG_GP: usize = 28;
const REG_SP: usize = 29;
const REG_FP: usize = 30;

pub struct System {
    bus: Bus,
    cpu: Cpu,
    code_cache: CodeCache,
    gpu: Arc<Mutex<Gpu>>,
    interrupts: Arc<InterruptController>,
    frame_ticks: u64,
    frame_count: u64,
}

impl System {
    /// Build the console around `bios` and reset the CPU to the BIOS entry
    pub fn new(config: &Config, bios: &[u8]) -> Result<Self> {
        let mut bus = Bus::new(bios)?;
        let interrupts = Arc::clone(bus.interrupts());

        let gpu = Arc::new(Mutex::new(Gpu::new(&config.gpu, config.general.pal, Arc::clone(&interrupts))?));
        let device: SharedIoDevice = gpu.clone();
        bus.attach("GPU", GPU_BASE, GPU_SIZE, device);

        let code_cache = CodeCache::new(&config.cpu, &bus, None);
        let mut cpu = Cpu::new(Arc::clone(&interrupts));
        cpu.reset();

        let frame_ticks = if config.general.pal {
            FRAME_TICKS_PAL
        } else {
            FRAME_TICKS_NTSC
        };

        tracing::info!(
            "System created: {} video, CPU mode {:?}, GPU thread {}",
            if config.general.pal { "PAL" } else { "NTSC" },
            config.cpu.execution_mode,
            config.gpu.use_thread
        );

        Ok(Self {
            bus,
            cpu,
            code_cache,
            gpu,
            interrupts,
            frame_ticks,
            frame_count: 0,
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn gpu(&self) -> &Arc<Mutex<Gpu>> {
        &self.gpu
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one video frame: CPU slices with the GPU catching up after each,
    /// then vertical blank
    pub fn run_frame(&mut self) {
        let frame_end = self.cpu.pending_ticks + self.frame_ticks;

        while self.cpu.pending_ticks < frame_end {
            let slice_start = self.cpu.pending_ticks;
            self.cpu.downcount = (slice_start + SLICE_TICKS).min(frame_end);
            self.code_cache.execute(&mut self.cpu, &mut self.bus);

            let elapsed = self.cpu.pending_ticks - slice_start;
            self.gpu.lock().run_ticks(elapsed.min(u32::MAX as u64) as u32);
        }

        self.interrupts.request(Interrupt::VBlank);
        self.gpu.lock().end_frame();
        self.frame_count += 1;

        tracing::trace!(
            "Frame {} done at {} ticks, {} blocks compiled",
            self.frame_count,
            self.cpu.pending_ticks,
            self.code_cache.stats().blocks_compiled
        );
    }

    /// Side-load a PS-X EXE and jump to its entry point
    pub fn load_exe(&mut self, data: &[u8]) -> Result<()> {
        let header = ExeHeader::parse(data)?;
        let text = &data[EXE_HEADER_SIZE..];
        let size = (header.file_size as usize).min(text.len());
        if size < header.file_size as usize {
            tracing::warn!(
                "EXE text truncated: header says {} bytes, file has {}",
                header.file_size,
                text.len()
            );
        }

        for (offset, &byte) in text[..size].iter().enumerate() {
            self.bus.write_u8(header.load_address.wrapping_add(offset as u32), byte)?;
        }
        for offset in 0..header.memfill_size {
            self.bus.write_u8(header.memfill_start.wrapping_add(offset), 0)?;
        }

        self.code_cache.flush();
        self.cpu.write_reg(REG_GP, header.initial_gp);
        if let Some(sp) = header.initial_sp() {
            self.cpu.write_reg(REG_SP, sp);
            self.cpu.write_reg(REG_FP, sp);
        }
        self.cpu.set_pc(header.initial_pc);

        tracing::info!(
            "Loaded EXE: {} bytes at 0x{:08x}, entry 0x{:08x}",
            size,
            header.load_address,
            header.initial_pc
        );
        Ok(())
    }

    /// RGBA8888 scanout of the last frame, 1024 pixels per row
    pub fn display_buffer(&self) -> Vec<u32> {
        self.gpu.lock().display_buffer()
    }
}
