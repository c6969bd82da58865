//! GPU command processor
//!
//! Owns the GP0 FIFO and the guest-visible register state, decodes command
//! words into backend records and keeps the approximate command timing.

use crate::backend::GpuBackend;
use crate::commands::{BackendCommand, DisplayParams, VramRect};
use crate::fifo::GpuFifo;
use crate::gp0::COMMAND_HANDLERS;
use crate::renderer::SoftwareRenderer;
use crate::types::{
    CommandParameters, DrawModeReg, InterlacedDisplayMode, Rect, RenderCommand, TextureWindowReg,
    VRAM_HEIGHT, VRAM_HEIGHT_MASK, VRAM_WIDTH,
};
use px_core::config::GpuConfig;
use px_core::GpuError;
use px_memory::{AccessSize, Interrupt, InterruptController, IoDevice};
use std::sync::Arc;

/// GPUSTAT after reset: display disabled, interlace field set, ready bits set
pub const GPUSTAT_RESET_VALUE: u32 = 0x1480_2000;

pub(crate) mod stat {
    pub const DRAW_MODE_MASK: u32 = 0x7FF;
    pub const SET_MASK_WHILE_DRAWING: u32 = 1 << 11;
    pub const CHECK_MASK_BEFORE_DRAW: u32 = 1 << 12;
    pub const INTERLACED_FIELD: u32 = 1 << 13;
    pub const REVERSE_FLAG: u32 = 1 << 14;
    pub const TEXTURE_DISABLE: u32 = 1 << 15;
    pub const HORIZONTAL_RESOLUTION_2: u32 = 1 << 16;
    pub const HORIZONTAL_RESOLUTION_1_SHIFT: u32 = 17;
    pub const VERTICAL_RESOLUTION: u32 = 1 << 19;
    pub const PAL_MODE: u32 = 1 << 20;
    pub const DISPLAY_24BIT: u32 = 1 << 21;
    pub const VERTICAL_INTERLACE: u32 = 1 << 22;
    pub const DISPLAY_DISABLE: u32 = 1 << 23;
    pub const INTERRUPT_REQUEST: u32 = 1 << 24;
    pub const DMA_DATA_REQUEST: u32 = 1 << 25;
    pub const GPU_IDLE: u32 = 1 << 26;
    pub const READY_TO_SEND_VRAM: u32 = 1 << 27;
    pub const READY_TO_RECEIVE_DMA: u32 = 1 << 28;
    pub const DMA_DIRECTION_SHIFT: u32 = 29;
    pub const DISPLAY_LINE_LSB: u32 = 1 << 31;

    /// Bits recomputed on every read
    pub const DYNAMIC: u32 = DMA_DATA_REQUEST | GPU_IDLE | READY_TO_SEND_VRAM | READY_TO_RECEIVE_DMA | DISPLAY_LINE_LSB;

    /// Vertical interlace with 480 lines, drawing to the displayed field disallowed
    pub const SKIP_FIELD_MASK: u32 = VERTICAL_RESOLUTION | VERTICAL_INTERLACE | (1 << 10);
    pub const SKIP_FIELD_ACTIVE: u32 = VERTICAL_RESOLUTION | VERTICAL_INTERLACE;
}

/// Command processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlitterState {
    #[default]
    Idle,
    ReadingVram,
    WritingVram,
    DrawingPolyLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    Off,
    Fifo,
    CpuToGp0,
    GpuReadToCpu,
}

impl DmaDirection {
    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Off,
            1 => Self::Fifo,
            2 => Self::CpuToGp0,
            _ => Self::GpuReadToCpu,
        }
    }
}

/// Per-frame command counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub num_polygons: u32,
    pub num_vertices: u32,
    pub num_vram_fills: u32,
    pub num_vram_reads: u32,
    pub num_vram_writes: u32,
    pub num_vram_copies: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawingOffset {
    pub x: i32,
    pub y: i32,
}

/// Rectangle of an in-flight CPU transfer plus the read position
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VramTransfer {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub col: u16,
    pub row: u16,
}

/// GP1(05h)-(07h) display registers
#[derive(Debug, Clone, Copy)]
struct CrtcRegs {
    display_address_start: u32,
    horizontal_display_range: u32,
    vertical_display_range: u32,
}

impl CrtcRegs {
    const DISPLAY_ADDRESS_START_MASK: u32 = 0x7FFFE;
    const HORIZONTAL_DISPLAY_RANGE_MASK: u32 = 0xFF_FFFF;
    const VERTICAL_DISPLAY_RANGE_MASK: u32 = 0xF_FFFF;

    fn x(&self) -> u16 {
        (self.display_address_start & 0x3FF) as u16
    }

    fn y(&self) -> u16 {
        ((self.display_address_start >> 10) & 0x1FF) as u16
    }

    fn x1(&self) -> u16 {
        (self.horizontal_display_range & 0xFFF) as u16
    }

    fn x2(&self) -> u16 {
        ((self.horizontal_display_range >> 12) & 0xFFF) as u16
    }

    fn y1(&self) -> u16 {
        (self.vertical_display_range & 0x3FF) as u16
    }

    fn y2(&self) -> u16 {
        ((self.vertical_display_range >> 10) & 0x3FF) as u16
    }
}

impl Default for CrtcRegs {
    fn default() -> Self {
        Self {
            display_address_start: 0,
            horizontal_display_range: 0xC6_0260,
            vertical_display_range: 0x3_FC10,
        }
    }
}

/// Display timing reduced to what scanout needs
#[derive(Debug, Clone, Copy, Default)]
struct CrtcState {
    regs: CrtcRegs,
    dot_clock_divider: u16,
    display_vram_width: u16,
    display_vram_height: u16,
    interlaced_field: u8,
    active_line_lsb: u8,
}

pub struct Gpu {
    pub(crate) backend: GpuBackend,
    interrupts: Arc<InterruptController>,

    pub(crate) fifo: GpuFifo,
    pub(crate) blitter_state: BlitterState,
    pub(crate) command_total_words: usize,
    pub(crate) pending_command_ticks: i32,
    max_run_ahead: i32,

    pub(crate) gpustat: u32,
    gpuread_latch: u32,

    pub(crate) draw_mode: DrawModeReg,
    pub(crate) texture_window: TextureWindowReg,
    pub(crate) drawing_area: Rect<u16>,
    pub(crate) drawing_offset: DrawingOffset,
    pub(crate) set_texture_disable_mask: bool,
    force_progressive_scan: bool,
    console_is_pal: bool,
    resolution_scale: u32,
    crtc: CrtcState,

    pub(crate) vram_transfer: VramTransfer,
    vram_read_buffer: Vec<u16>,
    pub(crate) blit_buffer: Vec<u32>,
    pub(crate) blit_remaining_words: u32,
    pub(crate) render_command: RenderCommand,

    pub(crate) stats: GpuStats,
    last_stats: GpuStats,
    frame_number: u64,
}

impl Gpu {
    /// Create a GPU with the software renderer
    pub fn new(config: &GpuConfig, pal: bool, interrupts: Arc<InterruptController>) -> Result<Self, GpuError> {
        let backend = GpuBackend::new(Box::new(SoftwareRenderer::new()), config.use_thread)?;
        Ok(Self::with_backend(backend, config, pal, interrupts))
    }

    pub fn with_backend(
        backend: GpuBackend,
        config: &GpuConfig,
        pal: bool,
        interrupts: Arc<InterruptController>,
    ) -> Self {
        let mut gpu = Self {
            backend,
            interrupts,
            fifo: GpuFifo::new(),
            blitter_state: BlitterState::Idle,
            command_total_words: 0,
            pending_command_ticks: 0,
            max_run_ahead: config.max_run_ahead.min(i32::MAX as u32) as i32,
            gpustat: 0,
            gpuread_latch: 0,
            draw_mode: DrawModeReg::default(),
            texture_window: TextureWindowReg::default(),
            drawing_area: Rect::new(0, 0, VRAM_WIDTH as u16, VRAM_HEIGHT as u16),
            drawing_offset: DrawingOffset::default(),
            set_texture_disable_mask: false,
            force_progressive_scan: config.force_progressive_scan,
            console_is_pal: pal,
            resolution_scale: config.clamped_resolution_scale(),
            crtc: CrtcState::default(),
            vram_transfer: VramTransfer::default(),
            vram_read_buffer: Vec::new(),
            blit_buffer: Vec::new(),
            blit_remaining_words: 0,
            render_command: RenderCommand::default(),
            stats: GpuStats::default(),
            last_stats: GpuStats::default(),
            frame_number: 0,
        };
        gpu.reset();
        gpu
    }

    /// Power-on reset, VRAM included
    pub fn reset(&mut self) {
        self.backend.push_command(&BackendCommand::Reset);
        self.backend
            .push_command(&BackendCommand::UpdateResolutionScale(self.resolution_scale));
        self.soft_reset();
        self.frame_number = 0;
        self.stats = GpuStats::default();
        self.last_stats = GpuStats::default();
    }

    /// GP1(00h): registers and FIFO, VRAM untouched
    pub fn soft_reset(&mut self) {
        if self.blitter_state == BlitterState::WritingVram {
            self.finish_vram_write();
        }

        self.fifo.clear();
        self.blit_buffer.clear();
        self.blit_remaining_words = 0;
        self.vram_read_buffer.clear();
        self.vram_transfer = VramTransfer::default();
        self.end_command();
        self.pending_command_ticks = 0;

        self.gpustat = GPUSTAT_RESET_VALUE;
        if self.console_is_pal {
            self.gpustat |= stat::PAL_MODE;
        }
        self.gpuread_latch = 0;
        self.set_texture_disable_mask = false;
        self.set_draw_mode(0);
        self.texture_window = TextureWindowReg::default();
        self.drawing_offset = DrawingOffset::default();
        self.drawing_area = Rect::new(0, 0, 0, 0);
        self.update_drawing_area();

        self.crtc = CrtcState::default();
        self.update_crtc_config();
        tracing::debug!("GPU: soft reset, GPUSTAT 0x{:08x}", self.gpustat);
    }

    pub fn blitter_state(&self) -> BlitterState {
        self.blitter_state
    }

    pub fn drawing_area(&self) -> Rect<u16> {
        self.drawing_area
    }

    pub fn drawing_offset(&self) -> DrawingOffset {
        self.drawing_offset
    }

    pub fn draw_mode(&self) -> DrawModeReg {
        self.draw_mode
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo.len()
    }

    /// GPU ticks charged but not yet paid for
    pub fn pending_command_ticks(&self) -> i32 {
        self.pending_command_ticks
    }

    /// Counters of the last completed frame
    pub fn stats(&self) -> GpuStats {
        self.last_stats
    }

    /// Counters of the frame in progress
    pub fn current_stats(&self) -> GpuStats {
        self.stats
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn backend(&self) -> &GpuBackend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut GpuBackend {
        &mut self.backend
    }

    // Register surface

    /// Queue a GP0 word and run as many commands as timing allows
    pub fn write_gp0(&mut self, value: u32) {
        self.push_fifo(0, value);
        self.execute_commands();
    }

    /// DMA channel 2 write; `address` is kept alongside the word
    pub fn dma_write(&mut self, address: u32, value: u32) {
        self.push_fifo(address, value);
    }

    /// Finish a DMA block write
    pub fn end_dma_write(&mut self) {
        self.execute_commands();
    }

    /// DMA channel 2 read
    pub fn dma_read(&mut self, words: &mut [u32]) {
        for word in words {
            *word = self.read_gpuread();
        }
    }

    fn push_fifo(&mut self, address: u32, value: u32) {
        if !self.fifo.push(address, value) {
            tracing::warn!("GPU: GP0 FIFO full, dropping 0x{:08x}", value);
        }
    }

    /// GPUSTAT with the handshake bits computed for the current state
    pub fn read_gpustat(&self) -> u32 {
        let mut value = self.gpustat & !stat::DYNAMIC;

        let ready_to_send_vram = self.blitter_state == BlitterState::ReadingVram;
        let ready_to_receive_dma = self.fifo.is_empty() || self.fifo.len() < self.command_total_words;
        let idle = self.blitter_state == BlitterState::Idle && self.pending_command_ticks <= 0 && self.fifo.is_empty();
        let dma_request = match DmaDirection::from_bits(self.gpustat >> stat::DMA_DIRECTION_SHIFT) {
            DmaDirection::Off => false,
            DmaDirection::Fifo => !self.fifo.is_full(),
            DmaDirection::CpuToGp0 => ready_to_receive_dma,
            DmaDirection::GpuReadToCpu => ready_to_send_vram,
        };

        if ready_to_send_vram {
            value |= stat::READY_TO_SEND_VRAM;
        }
        if ready_to_receive_dma {
            value |= stat::READY_TO_RECEIVE_DMA;
        }
        if idle {
            value |= stat::GPU_IDLE;
        }
        if dma_request {
            value |= stat::DMA_DATA_REQUEST;
        }
        if self.crtc.active_line_lsb != 0 {
            value |= stat::DISPLAY_LINE_LSB;
        }
        value
    }

    /// Two VRAM pixels while a VRAM-to-CPU transfer is active, otherwise
    /// the GP1(10h) info latch
    pub fn read_gpuread(&mut self) -> u32 {
        if self.blitter_state != BlitterState::ReadingVram {
            return self.gpuread_latch;
        }

        let mut value = 0u32;
        for i in 0..2 {
            let t = &mut self.vram_transfer;
            let index = t.row as usize * t.width as usize + t.col as usize;
            let pixel = self.vram_read_buffer.get(index).copied().unwrap_or(0);
            value |= (pixel as u32) << (i * 16);

            t.col += 1;
            if t.col == t.width {
                t.col = 0;
                t.row += 1;
                if t.row == t.height {
                    tracing::debug!("GPU: end of VRAM to CPU transfer");
                    self.vram_transfer = VramTransfer::default();
                    self.vram_read_buffer.clear();
                    self.blitter_state = BlitterState::Idle;
                    self.execute_commands();
                    break;
                }
            }
        }

        self.gpuread_latch = value;
        value
    }

    /// GP1 control port
    pub fn write_gp1(&mut self, value: u32) {
        let command = (value >> 24) & 0x3F;
        let param = value & 0x00FF_FFFF;

        match command {
            0x00 => {
                tracing::debug!("GP1 reset");
                self.soft_reset();
            }
            0x01 => {
                tracing::debug!("GP1 reset command buffer");
                if self.blitter_state == BlitterState::WritingVram {
                    self.finish_vram_write();
                }
                self.end_command();
                self.fifo.clear();
                self.blit_buffer.clear();
                self.blit_remaining_words = 0;
                self.vram_read_buffer.clear();
                self.vram_transfer = VramTransfer::default();
                self.pending_command_ticks = 0;
            }
            0x02 => {
                tracing::debug!("GP1 acknowledge interrupt");
                self.gpustat &= !stat::INTERRUPT_REQUEST;
            }
            0x03 => {
                let disable = param & 1 != 0;
                tracing::debug!("GP1 display {}", if disable { "disabled" } else { "enabled" });
                self.set_gpustat_bit(stat::DISPLAY_DISABLE, disable);
                self.update_crtc_config();
            }
            0x04 => {
                tracing::debug!("GP1 DMA direction {:?}", DmaDirection::from_bits(param));
                self.gpustat = (self.gpustat & !(3 << stat::DMA_DIRECTION_SHIFT)) | ((param & 3) << stat::DMA_DIRECTION_SHIFT);
            }
            0x05 => {
                self.crtc.regs.display_address_start = param & CrtcRegs::DISPLAY_ADDRESS_START_MASK;
                tracing::debug!("GP1 display start ({}, {})", self.crtc.regs.x(), self.crtc.regs.y());
                self.update_crtc_config();
            }
            0x06 => {
                self.crtc.regs.horizontal_display_range = param & CrtcRegs::HORIZONTAL_DISPLAY_RANGE_MASK;
                tracing::debug!("GP1 horizontal range {}-{}", self.crtc.regs.x1(), self.crtc.regs.x2());
                self.update_crtc_config();
            }
            0x07 => {
                self.crtc.regs.vertical_display_range = param & CrtcRegs::VERTICAL_DISPLAY_RANGE_MASK;
                tracing::debug!("GP1 vertical range {}-{}", self.crtc.regs.y1(), self.crtc.regs.y2());
                self.update_crtc_config();
            }
            0x08 => self.set_display_mode(param),
            0x09 => {
                self.set_texture_disable_mask = param & 1 != 0;
                tracing::debug!("GP1 allow texture disable: {}", self.set_texture_disable_mask);
            }
            0x10..=0x1F => self.handle_get_gpu_info(param),
            _ => tracing::warn!("GPU: unimplemented GP1 command 0x{:02x}", command),
        }
    }

    fn set_display_mode(&mut self, param: u32) {
        const MODE_BITS: u32 = (3 << stat::HORIZONTAL_RESOLUTION_1_SHIFT)
            | stat::VERTICAL_RESOLUTION
            | stat::PAL_MODE
            | stat::DISPLAY_24BIT
            | stat::VERTICAL_INTERLACE
            | stat::HORIZONTAL_RESOLUTION_2
            | stat::REVERSE_FLAG;

        let mut bits = ((param & 3) << stat::HORIZONTAL_RESOLUTION_1_SHIFT)
            | ((param & 0x3C) << 17)
            | ((param & 0x40) << 10)
            | ((param & 0x80) << 7);
        bits &= MODE_BITS;

        let new = (self.gpustat & !MODE_BITS) | bits;
        if new != self.gpustat {
            self.gpustat = new;
            tracing::debug!("GP1 display mode 0x{:02x}", param & 0xFF);
            self.update_crtc_config();
        }
    }

    fn handle_get_gpu_info(&mut self, param: u32) {
        match param & 0x07 {
            0x02 => self.gpuread_latch = self.texture_window.0,
            0x03 => {
                self.gpuread_latch = self.drawing_area.left as u32 | ((self.drawing_area.top as u32) << 10);
            }
            0x04 => {
                self.gpuread_latch = self.drawing_area.right as u32 | ((self.drawing_area.bottom as u32) << 10);
            }
            0x05 => {
                self.gpuread_latch =
                    (self.drawing_offset.x as u32 & 0x7FF) | ((self.drawing_offset.y as u32 & 0x7FF) << 11);
            }
            _ => {}
        }
        tracing::debug!("GP1 get info 0x{:x}: 0x{:08x}", param & 0x07, self.gpuread_latch);
    }

    fn set_gpustat_bit(&mut self, bit: u32, set: bool) {
        if set {
            self.gpustat |= bit;
        } else {
            self.gpustat &= !bit;
        }
    }

    // Command processing

    /// Run commands from the FIFO until it runs dry, a command is
    /// incomplete, or pending ticks exceed the run-ahead budget
    pub fn execute_commands(&mut self) {
        while self.pending_command_ticks <= self.max_run_ahead && !self.fifo.is_empty() {
            match self.blitter_state {
                BlitterState::Idle => {
                    let command = self.fifo.peek(0) >> 24;
                    if !COMMAND_HANDLERS[command as usize](self) {
                        break;
                    }
                }
                BlitterState::WritingVram => {
                    let words = (self.blit_remaining_words as usize).min(self.fifo.len());
                    self.blit_buffer.reserve(words);
                    for _ in 0..words {
                        let word = self.fifo.pop();
                        self.blit_buffer.push(word);
                    }
                    self.blit_remaining_words -= words as u32;
                    self.add_command_ticks(words as i32);
                    tracing::trace!(
                        "GPU: VRAM write burst of {} words, {} remaining",
                        words,
                        self.blit_remaining_words
                    );

                    if self.blit_remaining_words == 0 {
                        self.finish_vram_write();
                    }
                }
                BlitterState::ReadingVram => break,
                BlitterState::DrawingPolyLine => {
                    let shaded = self.render_command.shading_enable();
                    let words_per_vertex = if shaded { 2 } else { 1 };
                    let mut terminator = if shaded { (self.blit_buffer.len() & 1) ^ 1 } else { 0 };
                    while terminator < self.fifo.len() {
                        if self.fifo.peek(terminator) & 0xF000_F000 == 0x5000_5000 {
                            break;
                        }
                        terminator += words_per_vertex;
                    }

                    let found_terminator = terminator < self.fifo.len();
                    let words = terminator.min(self.fifo.len());
                    for _ in 0..words {
                        let word = self.fifo.pop();
                        self.blit_buffer.push(word);
                    }

                    if found_terminator {
                        self.fifo.remove(1);
                        self.finish_polyline_command();
                        self.blit_buffer.clear();
                        self.end_command();
                    }
                }
            }
        }
    }

    /// Pay down pending command ticks, `system_ticks` at two GPU ticks each
    pub fn run_ticks(&mut self, system_ticks: u32) {
        let gpu_ticks = system_ticks_to_gpu_ticks(system_ticks);
        self.pending_command_ticks = (self.pending_command_ticks - gpu_ticks).max(0);
        self.execute_commands();
    }

    /// System ticks until the pending command ticks are paid off
    pub fn pending_system_ticks(&self) -> u32 {
        if self.pending_command_ticks <= 0 {
            0
        } else {
            gpu_ticks_to_system_ticks(self.pending_command_ticks) as u32
        }
    }

    pub(crate) fn end_command(&mut self) {
        self.blitter_state = BlitterState::Idle;
        self.command_total_words = 0;
    }

    /// Record how many words the current command needs. Returns false
    /// when the FIFO does not hold them yet.
    pub(crate) fn check_command_size(&mut self, words: usize) -> bool {
        if self.fifo.len() < words {
            self.command_total_words = words;
            return false;
        }
        true
    }

    pub(crate) fn add_command_ticks(&mut self, ticks: i32) {
        self.pending_command_ticks = self.pending_command_ticks.saturating_add(ticks);
    }

    /// Drawing to the displayed field of a 480i frame is skipped
    pub(crate) fn is_interlaced_rendering_enabled(&self) -> bool {
        !self.force_progressive_scan && self.gpustat & stat::SKIP_FIELD_MASK == stat::SKIP_FIELD_ACTIVE
    }

    pub fn is_interlaced_display_enabled(&self) -> bool {
        !self.force_progressive_scan && self.gpustat & stat::VERTICAL_INTERLACE != 0
    }

    pub fn interlaced_display_mode(&self) -> InterlacedDisplayMode {
        if !self.is_interlaced_display_enabled() {
            InterlacedDisplayMode::None
        } else if self.gpustat & stat::VERTICAL_RESOLUTION != 0 {
            InterlacedDisplayMode::InterleavedFields
        } else {
            InterlacedDisplayMode::SeparateFields
        }
    }

    /// Mask and interlace flags for a new record
    pub(crate) fn command_parameters(&self) -> CommandParameters {
        let mut params = CommandParameters::empty();
        params.set(
            CommandParameters::CHECK_MASK_BEFORE_DRAW,
            self.gpustat & stat::CHECK_MASK_BEFORE_DRAW != 0,
        );
        params.set(
            CommandParameters::SET_MASK_WHILE_DRAWING,
            self.gpustat & stat::SET_MASK_WHILE_DRAWING != 0,
        );
        params.set(CommandParameters::ACTIVE_LINE_LSB, self.crtc.active_line_lsb != 0);
        params.set(CommandParameters::INTERLACED_RENDERING, self.is_interlaced_rendering_enabled());
        params
    }

    pub(crate) fn check_mask_before_draw(&self) -> bool {
        self.gpustat & stat::CHECK_MASK_BEFORE_DRAW != 0
    }

    /// Apply a GP0(E1h) value. Bit 11 survives only when GP1(09h) allows it.
    pub(crate) fn set_draw_mode(&mut self, value: u16) {
        let mut mode = DrawModeReg(value & DrawModeReg::MASK);
        if !self.set_texture_disable_mask {
            mode.set_texture_disable(false);
        }

        self.gpustat = (self.gpustat & !stat::DRAW_MODE_MASK) | (mode.0 as u32 & stat::DRAW_MODE_MASK);
        self.set_gpustat_bit(stat::TEXTURE_DISABLE, mode.texture_disable());
        self.draw_mode = mode;
    }

    pub(crate) fn update_drawing_area(&mut self) {
        let area = self.drawing_area;
        tracing::debug!(
            "GPU: drawing area ({}, {}) - ({}, {})",
            area.left,
            area.top,
            area.right,
            area.bottom
        );
        self.backend.push_command(&BackendCommand::SetDrawingArea(area.into()));
    }

    pub(crate) fn push_flush_render(&mut self) {
        self.backend.push_command(&BackendCommand::FlushRender);
    }

    /// Hand the accumulated CPU-to-VRAM words to the backend. A partial
    /// transfer writes only the rows that arrived.
    pub(crate) fn finish_vram_write(&mut self) {
        let t = self.vram_transfer;
        let width = t.width as usize;
        let total = width * t.height as usize;
        let pixels: Vec<u16> = self
            .blit_buffer
            .iter()
            .flat_map(|&word| [word as u16, (word >> 16) as u16])
            .take(total)
            .collect();
        let params = self.command_parameters();

        if pixels.len() == total {
            self.backend.push_command(&BackendCommand::UpdateVram {
                rect: VramRect {
                    x: t.x,
                    y: t.y,
                    width: t.width,
                    height: t.height,
                },
                params,
                data: &pixels,
            });
        } else if width > 0 {
            let rows = pixels.len() / width;
            let remainder = pixels.len() % width;
            tracing::debug!("GPU: partial VRAM write, {} rows and {} pixels", rows, remainder);
            if rows > 0 {
                self.backend.push_command(&BackendCommand::UpdateVram {
                    rect: VramRect {
                        x: t.x,
                        y: t.y,
                        width: t.width,
                        height: rows as u16,
                    },
                    params,
                    data: &pixels[..rows * width],
                });
            }
            if remainder > 0 {
                self.backend.push_command(&BackendCommand::UpdateVram {
                    rect: VramRect {
                        x: t.x,
                        y: ((t.y as u32 + rows as u32) & VRAM_HEIGHT_MASK) as u16,
                        width: remainder as u16,
                        height: 1,
                    },
                    params,
                    data: &pixels[rows * width..],
                });
            }
        }

        self.blit_buffer.clear();
        self.blit_remaining_words = 0;
        self.vram_transfer = VramTransfer::default();
        self.blitter_state = BlitterState::Idle;
        self.stats.num_vram_writes += 1;
    }

    /// Snapshot the rectangle of a VRAM-to-CPU transfer once the backend has
    /// caught up
    pub(crate) fn begin_vram_read(&mut self) {
        let t = self.vram_transfer;
        let rect = VramRect {
            x: t.x,
            y: t.y,
            width: t.width,
            height: t.height,
        };
        self.backend.push_command(&BackendCommand::ReadVram(rect));
        self.backend.sync();

        let mut buffer = std::mem::take(&mut self.vram_read_buffer);
        self.backend
            .read_vram_rect(t.x as u32, t.y as u32, t.width as u32, t.height as u32, &mut buffer);
        self.vram_read_buffer = buffer;
    }

    // Display

    fn update_crtc_config(&mut self) {
        const DOT_CLOCK_DIVIDERS: [u16; 4] = [10, 8, 5, 4];

        let divider = if self.gpustat & stat::HORIZONTAL_RESOLUTION_2 != 0 {
            7
        } else {
            DOT_CLOCK_DIVIDERS[((self.gpustat >> stat::HORIZONTAL_RESOLUTION_1_SHIFT) & 3) as usize]
        };

        let regs = self.crtc.regs;
        let horizontal_ticks = regs.x2().saturating_sub(regs.x1());
        let width = if horizontal_ticks == 0 {
            0
        } else {
            ((horizontal_ticks / divider + 2) & !3).min(VRAM_WIDTH as u16)
        };

        let mut height = regs.y2().saturating_sub(regs.y1());
        if self.gpustat & stat::SKIP_FIELD_ACTIVE == stat::SKIP_FIELD_ACTIVE {
            height *= 2;
        }

        self.crtc.dot_clock_divider = divider;
        self.crtc.display_vram_width = width;
        self.crtc.display_vram_height = height.min(VRAM_HEIGHT as u16);
        tracing::debug!(
            "GPU: display {}x{} at ({}, {}), dot clock divider {}",
            self.crtc.display_vram_width,
            self.crtc.display_vram_height,
            regs.x(),
            regs.y(),
            divider
        );
    }

    /// Whether the DAC is reading anything at all
    pub fn is_display_disabled(&self) -> bool {
        self.gpustat & stat::DISPLAY_DISABLE != 0
            || self.crtc.display_vram_width == 0
            || self.crtc.display_vram_height == 0
    }

    /// Scanout parameters for the current CRTC state
    pub fn display_params(&self) -> DisplayParams {
        let regs = self.crtc.regs;
        DisplayParams {
            display_aspect_ratio: 4.0 / 3.0,
            display_width: self.crtc.display_vram_width,
            display_height: self.crtc.display_vram_height,
            display_origin_left: 0,
            display_origin_top: 0,
            display_vram_left: regs.x(),
            display_vram_top: regs.y(),
            display_vram_width: self.crtc.display_vram_width,
            display_vram_height: self.crtc.display_vram_height,
            display_vram_start_x: regs.x(),
            display_vram_start_y: regs.y(),
            interlaced_display_mode: self.interlaced_display_mode() as u8,
            interlaced_display_field: self.crtc.interlaced_field,
            enabled: (!self.is_display_disabled()) as u8,
            display_24bit: (self.gpustat & stat::DISPLAY_24BIT != 0) as u8,
        }
    }

    /// Vertical blank: flip the interlaced field, scan out and close the frame
    pub fn end_frame(&mut self) {
        if self.is_interlaced_display_enabled() {
            self.crtc.interlaced_field ^= 1;
        } else {
            self.crtc.interlaced_field = 0;
        }
        self.crtc.active_line_lsb = if self.interlaced_display_mode() == InterlacedDisplayMode::InterleavedFields {
            self.crtc.interlaced_field
        } else {
            0
        };
        self.set_gpustat_bit(stat::INTERLACED_FIELD, self.crtc.interlaced_field != 0);

        let params = self.display_params();
        if params.is_enabled() {
            self.backend.push_command(&BackendCommand::UpdateDisplay(params));
        } else {
            self.backend.push_command(&BackendCommand::ClearDisplay);
        }
        self.backend.push_command(&BackendCommand::FrameDone);

        self.last_stats = std::mem::take(&mut self.stats);
        self.frame_number += 1;
        tracing::trace!(
            "GPU: frame {} done, {} polygons, field {}",
            self.frame_number,
            self.last_stats.num_polygons,
            self.crtc.interlaced_field
        );
    }

    /// Latch new settings and forward them to the backend
    pub fn update_settings(&mut self, config: &GpuConfig) {
        self.force_progressive_scan = config.force_progressive_scan;
        self.max_run_ahead = config.max_run_ahead.min(i32::MAX as u32) as i32;
        self.backend.push_command(&BackendCommand::UpdateSettings);

        let scale = config.clamped_resolution_scale();
        if scale != self.resolution_scale {
            self.resolution_scale = scale;
            self.backend.push_command(&BackendCommand::UpdateResolutionScale(scale));
        }
    }

    /// Copy of the RGBA8888 scanout buffer, 1024 pixels per row
    pub fn display_buffer(&mut self) -> Vec<u32> {
        self.backend.with_renderer(|r| r.display_buffer().to_vec())
    }

    pub fn save_state(&mut self) -> Vec<u8> {
        self.backend.save_state()
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), GpuError> {
        self.backend.load_state(data)?;
        self.drawing_area = self.backend.with_renderer(|r| r.drawing_area());
        Ok(())
    }

    pub(crate) fn raise_interrupt(&mut self) {
        if self.gpustat & stat::INTERRUPT_REQUEST == 0 {
            self.gpustat |= stat::INTERRUPT_REQUEST;
            self.interrupts.request(Interrupt::Gpu);
        }
    }
}

impl IoDevice for Gpu {
    fn read(&mut self, offset: u32, _size: AccessSize) -> u32 {
        match offset & !3 {
            0 => self.read_gpuread(),
            4 => self.read_gpustat(),
            _ => {
                tracing::warn!("GPU: read from unknown register offset 0x{:x}", offset);
                0xFFFF_FFFF
            }
        }
    }

    fn write(&mut self, offset: u32, value: u32, _size: AccessSize) {
        match offset & !3 {
            0 => self.write_gp0(value),
            4 => self.write_gp1(value),
            _ => tracing::warn!("GPU: write to unknown register offset 0x{:x}: 0x{:08x}", offset, value),
        }
    }
}

#[inline]
pub fn gpu_ticks_to_system_ticks(gpu_ticks: i32) -> i32 {
    (gpu_ticks >> 1).max(1)
}

#[inline]
pub fn system_ticks_to_gpu_ticks(system_ticks: u32) -> i32 {
    (system_ticks.min(i32::MAX as u32 >> 1) << 1) as i32
}
