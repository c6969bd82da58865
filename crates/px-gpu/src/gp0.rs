//! GP0 command decoding
//!
//! Every handler receives the GPU with the command word at the head of the
//! FIFO. A handler returns `false` when the FIFO does not yet hold the whole
//! command, in which case nothing has been consumed.

use crate::commands::{
    BackendCommand, CopyVramCommand, DrawLineCommand, DrawPolygonCommand, DrawRectangleCommand, DrawState,
    FillVramCommand, LineVertex, PolygonVertex, VramRect,
};
use crate::gpu::{stat, BlitterState, Gpu};
use crate::types::{
    min_max, truncate_vertex_position, DrawModeReg, Rect, RectangleSize, RenderCommand,
    TextureWindowReg, VertexPosition, MAX_PRIMITIVE_HEIGHT, MAX_PRIMITIVE_WIDTH, VRAM_COORD_MASK,
    VRAM_HEIGHT_MASK, VRAM_WIDTH_MASK,
};

pub(crate) type CommandHandler = fn(&mut Gpu) -> bool;

/// Handlers indexed by the top byte of the command word
pub(crate) static COMMAND_HANDLERS: [CommandHandler; 256] = build_handler_table();

const fn build_handler_table() -> [CommandHandler; 256] {
    let mut table: [CommandHandler; 256] = [handle_unknown; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match i {
            0x00 | 0x03..=0x1E | 0xE0 | 0xE7..=0xEF => handle_nop,
            0x01 => handle_clear_cache,
            0x02 => handle_fill_rectangle,
            0x1F => handle_interrupt_request,
            0x20..=0x3F => handle_render_polygon,
            0x40..=0x5F if i & 0x08 != 0 => handle_render_polyline,
            0x40..=0x5F => handle_render_line,
            0x60..=0x7F => handle_render_rectangle,
            0x80..=0x9F => handle_copy_vram_to_vram,
            0xA0..=0xBF => handle_copy_cpu_to_vram,
            0xC0..=0xDF => handle_copy_vram_to_cpu,
            0xE1 => handle_set_draw_mode,
            0xE2 => handle_set_texture_window,
            0xE3 => handle_set_drawing_area_top_left,
            0xE4 => handle_set_drawing_area_bottom_right,
            0xE5 => handle_set_drawing_offset,
            0xE6 => handle_set_mask_bit,
            _ => handle_unknown,
        };
        i += 1;
    }
    table
}

#[inline]
fn replace_zero(value: u32, replacement: u32) -> u32 {
    if value == 0 {
        replacement
    } else {
        value
    }
}

#[inline]
fn sign_extend_11(value: u32) -> i32 {
    ((value << 21) as i32) >> 21
}

fn handle_unknown(gpu: &mut Gpu) -> bool {
    let command = gpu.fifo.peek(0) >> 24;
    tracing::error!("GPU: unimplemented GP0 command 0x{:02x}", command);
    tracing::error!("GPU: FIFO {}", gpu.fifo.dump());

    gpu.fifo.remove(1);
    gpu.end_command();
    true
}

fn handle_nop(gpu: &mut Gpu) -> bool {
    gpu.fifo.remove(1);
    gpu.end_command();
    true
}

fn handle_clear_cache(gpu: &mut Gpu) -> bool {
    tracing::debug!("GP0 clear cache");
    gpu.fifo.remove(1);
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_interrupt_request(gpu: &mut Gpu) -> bool {
    tracing::warn!("GP0 interrupt request");
    gpu.raise_interrupt();
    gpu.fifo.remove(1);
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_draw_mode(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    tracing::debug!("GP0 set draw mode 0x{:06x}", param);
    gpu.set_draw_mode(param as u16);
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_texture_window(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    gpu.texture_window = TextureWindowReg(param & TextureWindowReg::MASK);
    let window = gpu.texture_window;
    tracing::debug!(
        "GP0 set texture window mask ({}, {}) offset ({}, {})",
        window.mask_x(),
        window.mask_y(),
        window.offset_x(),
        window.offset_y()
    );
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_drawing_area_top_left(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    let left = (param & VRAM_WIDTH_MASK) as u16;
    let top = ((param >> 10) & VRAM_HEIGHT_MASK) as u16;
    if gpu.drawing_area.left != left || gpu.drawing_area.top != top {
        gpu.drawing_area.left = left;
        gpu.drawing_area.top = top;
        gpu.update_drawing_area();
    }
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_drawing_area_bottom_right(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    let right = (param & VRAM_WIDTH_MASK) as u16;
    let bottom = ((param >> 10) & VRAM_HEIGHT_MASK) as u16;
    if gpu.drawing_area.right != right || gpu.drawing_area.bottom != bottom {
        gpu.drawing_area.right = right;
        gpu.drawing_area.bottom = bottom;
        gpu.update_drawing_area();
    }
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_drawing_offset(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    let x = sign_extend_11(param & 0x7FF);
    let y = sign_extend_11((param >> 11) & 0x7FF);
    tracing::debug!("GP0 set drawing offset ({}, {})", x, y);
    if gpu.drawing_offset.x != x || gpu.drawing_offset.y != y {
        gpu.push_flush_render();
        gpu.drawing_offset.x = x;
        gpu.drawing_offset.y = y;
    }
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

fn handle_set_mask_bit(gpu: &mut Gpu) -> bool {
    let param = gpu.fifo.pop() & 0x00FF_FFFF;
    let mask = stat::SET_MASK_WHILE_DRAWING | stat::CHECK_MASK_BEFORE_DRAW;
    gpu.gpustat = (gpu.gpustat & !mask) | ((param & 3) << 11);
    tracing::debug!("GP0 set mask bit: set {} check {}", param & 1, (param >> 1) & 1);
    gpu.add_command_ticks(1);
    gpu.end_command();
    true
}

impl Gpu {
    fn draw_state(&self, rc: RenderCommand) -> DrawState {
        DrawState {
            rc: rc.0,
            draw_mode: self.draw_mode.0,
            palette: 0,
            window: self.texture_window.window(),
        }
    }

    /// Inclusive clip of `[min, max]` against the drawing area, returned
    /// with exclusive right and bottom edges
    fn clip_bounds(&self, min_x: i32, max_x: i32, min_y: i32, max_y: i32) -> Rect<u16> {
        let area = self.drawing_area;
        let (left, right) = (area.left as i32, area.right as i32);
        let (top, bottom) = (area.top as i32, area.bottom as i32);
        Rect::new(
            min_x.clamp(left, right) as u16,
            min_y.clamp(top, bottom) as u16,
            (max_x.clamp(left, right) + 1) as u16,
            (max_y.clamp(top, bottom) + 1) as u16,
        )
    }

    fn skip_drawing_to_active_field(&self) -> bool {
        self.gpustat & stat::SKIP_FIELD_MASK == stat::SKIP_FIELD_ACTIVE
    }

    fn add_draw_triangle_ticks(&mut self, bounds: Rect<u16>, textured: bool, transparent: bool) {
        let width = (bounds.right - bounds.left) as i32;
        let mut height = (bounds.bottom - bounds.top) as i32;
        let average_width = (width + 2) / 3;
        let mut ticks_per_row = average_width;
        if textured {
            ticks_per_row += average_width;
        }
        if transparent || self.check_mask_before_draw() {
            ticks_per_row += (average_width + 1) / 2;
        }
        if self.skip_drawing_to_active_field() {
            height = (height / 2).max(1);
        }
        self.add_command_ticks(ticks_per_row * height);
    }

    fn add_draw_rectangle_ticks(&mut self, bounds: Rect<u16>, textured: bool, transparent: bool) {
        let width = (bounds.right - bounds.left) as i32;
        let mut height = (bounds.bottom - bounds.top) as i32;
        let mut ticks_per_row = width;
        if textured {
            ticks_per_row += width;
        }
        if transparent || self.check_mask_before_draw() {
            ticks_per_row += (width + 1) / 2;
        }
        if self.skip_drawing_to_active_field() {
            height = (height / 2).max(1);
        }
        self.add_command_ticks(ticks_per_row * height);
    }

    fn add_draw_line_ticks(&mut self, bounds: Rect<u16>) {
        let width = (bounds.right - bounds.left) as i32;
        let mut height = (bounds.bottom - bounds.top) as i32;
        if self.skip_drawing_to_active_field() {
            height = (height / 2).max(1);
        }
        self.add_command_ticks(width.max(height));
    }

    fn pop_vertex_position(&mut self) -> (i32, i32) {
        let position = VertexPosition(self.fifo.pop());
        (self.drawing_offset.x + position.x(), self.drawing_offset.y + position.y())
    }

    /// Draw the vertices collected in the blit buffer as one line strip
    pub(crate) fn finish_polyline_command(&mut self) {
        let rc = self.render_command;
        let shaded = rc.shading_enable();
        let num_vertices = (self.blit_buffer.len() + shaded as usize) >> shaded as usize;
        tracing::debug!("GP0 drawing polyline with {} vertices", num_vertices);
        if !self.drawing_area.is_valid() || num_vertices < 2 {
            return;
        }

        let offset = self.drawing_offset;
        let mut words = self.blit_buffer.iter().copied();
        let mut vertices: Vec<LineVertex> = Vec::with_capacity(num_vertices);
        let mut bounds: Rect<u16> = Rect::default();
        bounds.set_invalid();
        let mut segment_bounds = Vec::new();

        for i in 0..num_vertices {
            let color = if shaded && i > 0 {
                words.next().unwrap_or(0) & 0x00FF_FFFF
            } else {
                rc.color_for_first_vertex()
            };
            let position = VertexPosition(words.next().unwrap_or(0));
            let vertex = LineVertex {
                x: offset.x + position.x(),
                y: offset.y + position.y(),
                color,
            };

            if let Some(prev) = vertices.last() {
                let (min_x, max_x) = min_max(prev.x, vertex.x);
                let (min_y, max_y) = min_max(prev.y, vertex.y);
                if (max_x - min_x) as u32 >= MAX_PRIMITIVE_WIDTH || (max_y - min_y) as u32 >= MAX_PRIMITIVE_HEIGHT {
                    tracing::debug!(
                        "GP0 culling too-large polyline segment ({}, {}) - ({}, {})",
                        prev.x,
                        prev.y,
                        vertex.x,
                        vertex.y
                    );
                } else {
                    let clip = self.clip_bounds(min_x, max_x, min_y, max_y);
                    bounds.include(clip.left, clip.top, clip.right, clip.bottom);
                    segment_bounds.push(clip);
                }
            }
            vertices.push(vertex);
        }

        for clip in segment_bounds {
            self.add_draw_line_ticks(clip);
        }

        let cmd = DrawLineCommand {
            state: self.draw_state(rc),
            num_vertices: vertices.len() as u16,
            bounds: bounds.into(),
            ..Default::default()
        };
        let params = self.command_parameters();
        tracing::trace!("GP0 polyline of {} vertices", vertices.len());
        self.backend.push_command(&BackendCommand::DrawLine {
            cmd,
            params,
            vertices: &vertices,
        });
    }
}

fn handle_render_polygon(gpu: &mut Gpu) -> bool {
    const SETUP_TICKS: [[[i32; 2]; 2]; 2] = [[[46, 226], [334, 496]], [[82, 262], [370, 532]]];

    let rc = RenderCommand(gpu.fifo.peek(0));
    let textured = rc.texture_enable();
    let shaded = rc.shading_enable();
    let words_per_vertex = 1 + textured as usize + shaded as usize;
    let num_vertices = if rc.quad_polygon() { 4 } else { 3 };
    let total_words = words_per_vertex * num_vertices + !shaded as usize;
    if !gpu.check_command_size(total_words) {
        return false;
    }

    gpu.add_command_ticks(SETUP_TICKS[rc.quad_polygon() as usize][shaded as usize][textured as usize]);
    tracing::trace!(
        "GP0 render {} vertex {} {} {} polygon",
        num_vertices,
        if rc.transparency_enable() { "semi-transparent" } else { "opaque" },
        if textured { "textured" } else { "untextured" },
        if shaded { "shaded" } else { "flat" }
    );

    let mut state = gpu.draw_state(rc);
    if textured {
        let texpage = (gpu.fifo.peek(if shaded { 5 } else { 4 }) >> 16) as u16;
        gpu.gpustat = (gpu.gpustat & !DrawModeReg::GPUSTAT_MASK) | (texpage as u32 & DrawModeReg::GPUSTAT_MASK);
        state.draw_mode = (texpage & DrawModeReg::POLYGON_TEXPAGE_MASK)
            | (gpu.draw_mode.0 & !DrawModeReg::POLYGON_TEXPAGE_MASK);
        state.palette = (gpu.fifo.peek(2) >> 16) as u16;
    }

    gpu.stats.num_vertices += num_vertices as u32;
    gpu.stats.num_polygons += 1;
    gpu.fifo.remove(1);

    let mut vertices = [PolygonVertex::default(); 4];
    for (i, vertex) in vertices.iter_mut().take(num_vertices).enumerate() {
        vertex.color = if shaded && i > 0 {
            gpu.fifo.pop() & 0x00FF_FFFF
        } else {
            rc.color_for_first_vertex()
        };
        let (x, y) = gpu.pop_vertex_position();
        vertex.x = x;
        vertex.y = y;
        vertex.precise_x = x as f32;
        vertex.precise_y = y as f32;
        vertex.precise_w = 1.0;
        vertex.texcoord = if textured { gpu.fifo.pop() as u16 } else { 0 };
    }

    if !gpu.drawing_area.is_valid() {
        gpu.end_command();
        return true;
    }

    let (min_x_12, max_x_12) = min_max(vertices[1].x, vertices[2].x);
    let (min_y_12, max_y_12) = min_max(vertices[1].y, vertices[2].y);
    let min_x = min_x_12.min(vertices[0].x);
    let max_x = max_x_12.max(vertices[0].x);
    let min_y = min_y_12.min(vertices[0].y);
    let max_y = max_y_12.max(vertices[0].y);

    let mut bounds: Rect<u16> = Rect::default();
    if (max_x - min_x) as u32 >= MAX_PRIMITIVE_WIDTH || (max_y - min_y) as u32 >= MAX_PRIMITIVE_HEIGHT {
        tracing::debug!(
            "GP0 culling too-large polygon ({}, {}) ({}, {}) ({}, {})",
            vertices[0].x,
            vertices[0].y,
            vertices[1].x,
            vertices[1].y,
            vertices[2].x,
            vertices[2].y
        );
        if !rc.quad_polygon() {
            gpu.end_command();
            return true;
        }

        // Degenerate first half, the second half may still draw
        vertices[0] = vertices[1];
        bounds.set_invalid();
    } else {
        bounds = gpu.clip_bounds(min_x, max_x, min_y, max_y);
        gpu.add_draw_triangle_ticks(bounds, textured, rc.transparency_enable());
    }

    if rc.quad_polygon() {
        let min_x_123 = min_x_12.min(vertices[3].x);
        let max_x_123 = max_x_12.max(vertices[3].x);
        let min_y_123 = min_y_12.min(vertices[3].y);
        let max_y_123 = max_y_12.max(vertices[3].y);

        if (max_x_123 - min_x_123) as u32 >= MAX_PRIMITIVE_WIDTH
            || (max_y_123 - min_y_123) as u32 >= MAX_PRIMITIVE_HEIGHT
        {
            tracing::debug!("GP0 culling too-large polygon second half");
            // Bounds keep the first half, which still draws
            vertices[3] = vertices[2];
        } else {
            let clip = gpu.clip_bounds(min_x_123, max_x_123, min_y_123, max_y_123);
            bounds.include(clip.left, clip.top, clip.right, clip.bottom);
            gpu.add_draw_triangle_ticks(clip, textured, rc.transparency_enable());
        }
    }

    let cmd = DrawPolygonCommand {
        state,
        num_vertices: num_vertices as u16,
        bounds: bounds.into(),
        ..Default::default()
    };
    let params = gpu.command_parameters();
    gpu.backend.push_command(&BackendCommand::DrawPolygon {
        cmd,
        params,
        vertices: &vertices[..num_vertices],
    });

    gpu.end_command();
    true
}

fn handle_render_rectangle(gpu: &mut Gpu) -> bool {
    let rc = RenderCommand(gpu.fifo.peek(0));
    let textured = rc.texture_enable();
    let variable = rc.rectangle_size() == RectangleSize::Variable;
    let total_words = 2 + textured as usize + variable as usize;
    if !gpu.check_command_size(total_words) {
        return false;
    }

    gpu.add_command_ticks(16);
    tracing::trace!(
        "GP0 render {} {} rectangle",
        if rc.transparency_enable() { "semi-transparent" } else { "opaque" },
        if textured { "textured" } else { "untextured" }
    );

    gpu.stats.num_vertices += 1;
    gpu.stats.num_polygons += 1;
    gpu.fifo.remove(1);

    let mut cmd = DrawRectangleCommand {
        state: gpu.draw_state(rc),
        color: rc.color_for_first_vertex(),
        ..Default::default()
    };

    let position = VertexPosition(gpu.fifo.pop());
    cmd.x = truncate_vertex_position(gpu.drawing_offset.x + position.x());
    cmd.y = truncate_vertex_position(gpu.drawing_offset.y + position.y());

    if textured {
        let texcoord_and_palette = gpu.fifo.pop();
        cmd.state.palette = (texcoord_and_palette >> 16) as u16;
        cmd.texcoord = texcoord_and_palette as u16;
    }

    let (width, height) = match rc.rectangle_size() {
        RectangleSize::R1x1 => (1, 1),
        RectangleSize::R8x8 => (8, 8),
        RectangleSize::R16x16 => (16, 16),
        RectangleSize::Variable => {
            let size = gpu.fifo.pop();
            (size & VRAM_WIDTH_MASK, (size >> 16) & VRAM_HEIGHT_MASK)
        }
    };
    cmd.width = width as u16;
    cmd.height = height as u16;

    if width >= MAX_PRIMITIVE_WIDTH || height >= MAX_PRIMITIVE_HEIGHT {
        tracing::debug!("GP0 culling too-large rectangle ({}, {}) {}x{}", cmd.x, cmd.y, width, height);
        gpu.end_command();
        return true;
    }

    if !gpu.drawing_area.is_valid() {
        gpu.end_command();
        return true;
    }

    let bounds = gpu.clip_bounds(cmd.x, cmd.x + width as i32, cmd.y, cmd.y + height as i32);
    gpu.add_draw_rectangle_ticks(bounds, textured, rc.transparency_enable());

    let params = gpu.command_parameters();
    gpu.backend.push_command(&BackendCommand::DrawRectangle(cmd, params));

    gpu.end_command();
    true
}

fn handle_render_line(gpu: &mut Gpu) -> bool {
    let rc = RenderCommand(gpu.fifo.peek(0));
    let shaded = rc.shading_enable();
    let total_words = if shaded { 4 } else { 3 };
    if !gpu.check_command_size(total_words) {
        return false;
    }

    tracing::trace!(
        "GP0 render {} {} line",
        if rc.transparency_enable() { "semi-transparent" } else { "opaque" },
        if shaded { "shaded" } else { "flat" }
    );

    gpu.stats.num_vertices += 2;
    gpu.stats.num_polygons += 1;
    gpu.render_command = rc;
    gpu.fifo.remove(1);

    let first_color = rc.color_for_first_vertex();
    let (x0, y0) = gpu.pop_vertex_position();
    let end_color = if shaded {
        gpu.fifo.pop() & 0x00FF_FFFF
    } else {
        first_color
    };
    let (x1, y1) = gpu.pop_vertex_position();
    let vertices = [
        LineVertex {
            x: x0,
            y: y0,
            color: first_color,
        },
        LineVertex {
            x: x1,
            y: y1,
            color: end_color,
        },
    ];

    if !gpu.drawing_area.is_valid() {
        gpu.end_command();
        return true;
    }

    let (min_x, max_x) = min_max(x0, x1);
    let (min_y, max_y) = min_max(y0, y1);
    if (max_x - min_x) as u32 >= MAX_PRIMITIVE_WIDTH || (max_y - min_y) as u32 >= MAX_PRIMITIVE_HEIGHT {
        tracing::debug!("GP0 culling too-large line ({}, {}) - ({}, {})", x0, y0, x1, y1);
        gpu.end_command();
        return true;
    }

    let bounds = gpu.clip_bounds(min_x, max_x, min_y, max_y);
    gpu.add_draw_line_ticks(bounds);

    let cmd = DrawLineCommand {
        state: gpu.draw_state(rc),
        num_vertices: 2,
        bounds: bounds.into(),
        ..Default::default()
    };
    let params = gpu.command_parameters();
    gpu.backend.push_command(&BackendCommand::DrawLine {
        cmd,
        params,
        vertices: &vertices,
    });

    gpu.end_command();
    true
}

fn handle_render_polyline(gpu: &mut Gpu) -> bool {
    let rc = RenderCommand(gpu.fifo.peek(0));
    // Command word and the first two vertices
    let min_words = if rc.shading_enable() { 4 } else { 3 };
    if !gpu.check_command_size(min_words) {
        return false;
    }

    gpu.add_command_ticks(16);
    tracing::trace!(
        "GP0 render {} {} polyline",
        if rc.transparency_enable() { "semi-transparent" } else { "opaque" },
        if rc.shading_enable() { "shaded" } else { "flat" }
    );

    gpu.render_command = rc;
    gpu.fifo.remove(1);

    gpu.blit_buffer.clear();
    gpu.blit_buffer.reserve(min_words - 1);
    for _ in 0..min_words - 1 {
        let word = gpu.fifo.pop();
        gpu.blit_buffer.push(word);
    }

    // Remaining vertices are gathered until the terminator word arrives
    gpu.blitter_state = BlitterState::DrawingPolyLine;
    gpu.command_total_words = 0;
    true
}

fn handle_fill_rectangle(gpu: &mut Gpu) -> bool {
    if !gpu.check_command_size(3) {
        return false;
    }

    let color = gpu.fifo.pop() & 0x00FF_FFFF;
    let x = (gpu.fifo.peek(0) & 0x3F0) as u16;
    let y = ((gpu.fifo.pop() >> 16) & VRAM_COORD_MASK) as u16;
    let width = (((gpu.fifo.peek(0) & VRAM_WIDTH_MASK) + 0xF) & !0xF) as u16;
    let height = ((gpu.fifo.pop() >> 16) & VRAM_HEIGHT_MASK) as u16;
    tracing::debug!("GP0 fill VRAM ({}, {}) {}x{} with 0x{:06x}", x, y, width, height, color);

    gpu.add_command_ticks(46 + ((width as i32 / 8) + 9) * height as i32);

    let cmd = FillVramCommand {
        rect: VramRect { x, y, width, height },
        color,
        _pad: 0,
    };
    let params = gpu.command_parameters();
    gpu.backend.push_command(&BackendCommand::FillVram(cmd, params));
    gpu.stats.num_vram_fills += 1;

    gpu.end_command();
    true
}

fn handle_copy_cpu_to_vram(gpu: &mut Gpu) -> bool {
    if !gpu.check_command_size(3) {
        return false;
    }
    gpu.fifo.remove(1);

    let dst_x = gpu.fifo.peek(0) & VRAM_COORD_MASK;
    let dst_y = (gpu.fifo.pop() >> 16) & VRAM_COORD_MASK;
    let width = replace_zero(gpu.fifo.peek(0) & VRAM_WIDTH_MASK, 0x400);
    let height = replace_zero((gpu.fifo.pop() >> 16) & VRAM_HEIGHT_MASK, 0x200);
    let num_words = (width * height + 1) / 2;
    tracing::debug!("GP0 copy CPU to VRAM ({}, {}) {}x{}", dst_x, dst_y, width, height);

    gpu.end_command();

    gpu.blitter_state = BlitterState::WritingVram;
    gpu.blit_buffer.clear();
    gpu.blit_buffer.reserve(num_words as usize);
    gpu.blit_remaining_words = num_words;
    gpu.vram_transfer.x = dst_x as u16;
    gpu.vram_transfer.y = dst_y as u16;
    gpu.vram_transfer.width = width as u16;
    gpu.vram_transfer.height = height as u16;
    true
}

fn handle_copy_vram_to_cpu(gpu: &mut Gpu) -> bool {
    if !gpu.check_command_size(3) {
        return false;
    }
    gpu.fifo.remove(1);

    gpu.vram_transfer.x = (gpu.fifo.peek(0) & VRAM_COORD_MASK) as u16;
    gpu.vram_transfer.y = ((gpu.fifo.pop() >> 16) & VRAM_COORD_MASK) as u16;
    let size = gpu.fifo.pop();
    gpu.vram_transfer.width = (((size as u16).wrapping_sub(1) as u32 & VRAM_WIDTH_MASK) + 1) as u16;
    gpu.vram_transfer.height = ((((size >> 16) as u16).wrapping_sub(1) as u32 & VRAM_HEIGHT_MASK) + 1) as u16;
    gpu.vram_transfer.col = 0;
    gpu.vram_transfer.row = 0;
    tracing::debug!(
        "GP0 copy VRAM to CPU ({}, {}) {}x{}",
        gpu.vram_transfer.x,
        gpu.vram_transfer.y,
        gpu.vram_transfer.width,
        gpu.vram_transfer.height
    );

    gpu.begin_vram_read();

    gpu.stats.num_vram_reads += 1;
    gpu.blitter_state = BlitterState::ReadingVram;
    gpu.command_total_words = 0;
    true
}

fn handle_copy_vram_to_vram(gpu: &mut Gpu) -> bool {
    if !gpu.check_command_size(4) {
        return false;
    }
    gpu.fifo.remove(1);

    let src_x = gpu.fifo.peek(0) & VRAM_COORD_MASK;
    let src_y = (gpu.fifo.pop() >> 16) & VRAM_COORD_MASK;
    let dst_x = gpu.fifo.peek(0) & VRAM_COORD_MASK;
    let dst_y = (gpu.fifo.pop() >> 16) & VRAM_COORD_MASK;
    let width = replace_zero(gpu.fifo.peek(0) & VRAM_WIDTH_MASK, 0x400);
    let height = replace_zero((gpu.fifo.pop() >> 16) & VRAM_HEIGHT_MASK, 0x200);
    tracing::debug!(
        "GP0 copy VRAM ({}, {}) to ({}, {}) {}x{}",
        src_x,
        src_y,
        dst_x,
        dst_y,
        width,
        height
    );

    gpu.add_command_ticks((width * height * 2) as i32);

    let cmd = CopyVramCommand {
        src_x: src_x as u16,
        src_y: src_y as u16,
        dst_x: dst_x as u16,
        dst_y: dst_y as u16,
        width: width as u16,
        height: height as u16,
        _pad: 0,
    };
    let params = gpu.command_parameters();
    gpu.backend.push_command(&BackendCommand::CopyVram(cmd, params));
    gpu.stats.num_vram_copies += 1;

    gpu.end_command();
    true
}
