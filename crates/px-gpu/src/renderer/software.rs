//! Bit-exact software renderer

use super::line::draw_line;
use super::rectangle::draw_rectangle;
use super::shade::DrawContext;
use super::triangle::draw_triangle;
use super::vram::Vram;
use super::Renderer;
use crate::commands::{
    CopyVramCommand, DisplayParams, DrawLineCommand, DrawPolygonCommand, DrawRectangleCommand,
    LineVertex, PolygonVertex, VramRect,
};
use crate::types::{
    rgba5551_to_rgba8888, CommandParameters, DrawModeReg, InterlacedDisplayMode, Rect,
    RenderCommand, VRAM_HEIGHT, VRAM_WIDTH,
};

/// Pick the monomorphized variant of `$func` for a set of runtime flags.
/// The branches run once per primitive, never per pixel.
macro_rules! specialize {
    ($func:ident [$($flag:expr),*] ($($arg:expr),*)) => {
        specialize!(@step $func [] [$($flag),*] ($($arg),*))
    };
    (@step $func:ident [$($done:tt),*] [] ($($arg:expr),*)) => {
        $func::<$($done),*>($($arg),*)
    };
    (@step $func:ident [$($done:tt),*] [$head:expr $(, $tail:expr)*] ($($arg:expr),*)) => {
        if $head {
            specialize!(@step $func [$($done,)* true] [$($tail),*] ($($arg),*))
        } else {
            specialize!(@step $func [$($done,)* false] [$($tail),*] ($($arg),*))
        }
    };
}

pub struct SoftwareRenderer {
    vram: Vram,
    drawing_area: Rect<u16>,
    display: DisplayParams,
    display_buffer: Box<[u32]>,
}

impl Default for SoftwareRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self {
            vram: Vram::new(),
            drawing_area: Rect::default(),
            display: DisplayParams {
                display_aspect_ratio: 1.0,
                ..Default::default()
            },
            display_buffer: vec![0u32; (VRAM_WIDTH * VRAM_HEIGHT) as usize].into_boxed_slice(),
        }
    }

    /// Scan out 15-bit pixels starting at `dst_offset` in the display buffer
    fn copy_out_15bit(
        &mut self,
        src_x: u32,
        mut src_y: u32,
        dst_offset: usize,
        mut dst_stride: usize,
        width: u32,
        mut height: u32,
        interlaced: bool,
        interleaved: bool,
    ) {
        let width = width.min(VRAM_WIDTH);
        let interlaced_shift = u32::from(interlaced);
        let interleaved_shift = u32::from(interleaved);
        dst_stride <<= interlaced_shift;
        height >>= interlaced_shift;

        let pixels = self.vram.pixels();
        let mut dst = dst_offset;
        if src_x + width <= VRAM_WIDTH && src_y + height <= VRAM_HEIGHT {
            let src_stride = (VRAM_WIDTH << interleaved_shift) as usize;
            let mut src = (src_y * VRAM_WIDTH + src_x) as usize;
            for _ in 0..height {
                if src + width as usize > pixels.len() || dst + width as usize > self.display_buffer.len() {
                    break;
                }
                for (out, &pixel) in self.display_buffer[dst..dst + width as usize]
                    .iter_mut()
                    .zip(&pixels[src..src + width as usize])
                {
                    *out = rgba5551_to_rgba8888(pixel);
                }
                src += src_stride;
                dst += dst_stride;
            }
        } else {
            for _ in 0..height {
                if dst + width as usize > self.display_buffer.len() {
                    break;
                }
                let row = ((src_y % VRAM_HEIGHT) * VRAM_WIDTH) as usize;
                for (col, out) in self.display_buffer[dst..dst + width as usize].iter_mut().enumerate() {
                    let sx = (src_x + col as u32) % VRAM_WIDTH;
                    *out = rgba5551_to_rgba8888(pixels[row + sx as usize]);
                }
                src_y += 1 << interleaved_shift;
                dst += dst_stride;
            }
        }
    }

    /// Scan out packed 24-bit pixels; `width` counts output pixels
    fn copy_out_24bit(
        &mut self,
        src_x: u32,
        mut src_y: u32,
        dst_offset: usize,
        mut dst_stride: usize,
        width: u32,
        mut height: u32,
        interlaced: bool,
        interleaved: bool,
    ) {
        let width = width.min(VRAM_WIDTH);
        let interlaced_shift = u32::from(interlaced);
        let interleaved_shift = u32::from(interleaved);
        dst_stride <<= interlaced_shift;
        height >>= interlaced_shift;

        let pixels = self.vram.pixels();
        let mut dst = dst_offset;
        if src_x + width <= VRAM_WIDTH && src_y + height <= VRAM_HEIGHT {
            let bytes: &[u8] = bytemuck::cast_slice(pixels);
            let src_stride = (VRAM_WIDTH << interleaved_shift) as usize * 2;
            let mut src = (src_y * VRAM_WIDTH + src_x) as usize * 2;
            for _ in 0..height {
                if dst + width as usize > self.display_buffer.len() {
                    break;
                }
                for (col, out) in self.display_buffer[dst..dst + width as usize].iter_mut().enumerate() {
                    let at = src + col * 3;
                    let channel = |i: usize| bytes.get(at + i).copied().unwrap_or(0) as u32;
                    *out = channel(0) | (channel(1) << 8) | (channel(2) << 16) | 0xFF00_0000;
                }
                src += src_stride;
                dst += dst_stride;
            }
        } else {
            for _ in 0..height {
                if dst + width as usize > self.display_buffer.len() {
                    break;
                }
                let row = ((src_y % VRAM_HEIGHT) * VRAM_WIDTH) as usize;
                for (col, out) in self.display_buffer[dst..dst + width as usize].iter_mut().enumerate() {
                    let col = col as u32;
                    let offset = src_x + (col * 3) / 2;
                    let s0 = pixels[row + (offset % VRAM_WIDTH) as usize] as u32;
                    let s1 = pixels[row + ((offset + 1) % VRAM_WIDTH) as usize] as u32;
                    let shift = (col & 1) * 8;
                    *out = (((s1 << 16) | s0) >> shift) | 0xFF00_0000;
                }
                src_y += 1 << interleaved_shift;
                dst += dst_stride;
            }
        }
    }
}

impl Renderer for SoftwareRenderer {
    fn name(&self) -> &str {
        "Software"
    }

    fn reset(&mut self) {
        self.vram.clear();
        self.drawing_area = Rect::default();
        self.display = DisplayParams {
            display_aspect_ratio: 1.0,
            ..Default::default()
        };
        self.display_buffer.fill(0);
    }

    fn read_vram(&mut self, _rect: VramRect) {
        // VRAM is authoritative here, nothing to download
    }

    fn fill_vram(&mut self, rect: VramRect, color: u32, params: CommandParameters) {
        self.vram.fill(
            rect.x as u32,
            rect.y as u32,
            rect.width as u32,
            rect.height as u32,
            color,
            params,
        );
    }

    fn update_vram(&mut self, rect: VramRect, data: &[u16], params: CommandParameters) {
        self.vram.update(
            rect.x as u32,
            rect.y as u32,
            rect.width as u32,
            rect.height as u32,
            data,
            params,
        );
    }

    fn copy_vram(&mut self, cmd: &CopyVramCommand, params: CommandParameters) {
        self.vram.copy(
            cmd.src_x as u32,
            cmd.src_y as u32,
            cmd.dst_x as u32,
            cmd.dst_y as u32,
            cmd.width as u32,
            cmd.height as u32,
            params,
        );
    }

    fn set_drawing_area(&mut self, area: Rect<u16>) {
        self.drawing_area = area;
    }

    fn draw_polygon(&mut self, cmd: &DrawPolygonCommand, params: CommandParameters, vertices: &[PolygonVertex]) {
        let rc = RenderCommand(cmd.state.rc);
        let dither = rc.is_dithering_enabled() && DrawModeReg(cmd.state.draw_mode).dither_enable();
        let ctx = DrawContext::new(&cmd.state, params, self.drawing_area);
        let vram = &mut self.vram;

        let [v0, v1, v2, rest @ ..] = vertices else {
            return;
        };

        specialize!(draw_triangle
            [rc.shading_enable(), rc.texture_enable(), rc.raw_texture_enable(), rc.transparency_enable(), dither]
            (vram, &ctx, v0, v1, v2));

        if let (true, Some(v3)) = (rc.quad_polygon(), rest.first()) {
            specialize!(draw_triangle
                [rc.shading_enable(), rc.texture_enable(), rc.raw_texture_enable(), rc.transparency_enable(), dither]
                (vram, &ctx, v2, v1, v3));
        }
    }

    fn draw_rectangle(&mut self, cmd: &DrawRectangleCommand, params: CommandParameters) {
        let rc = RenderCommand(cmd.state.rc);
        let ctx = DrawContext::new(&cmd.state, params, self.drawing_area);
        let vram = &mut self.vram;

        specialize!(draw_rectangle
            [rc.texture_enable(), rc.raw_texture_enable(), rc.transparency_enable()]
            (vram, &ctx, cmd));
    }

    fn draw_line(&mut self, cmd: &DrawLineCommand, params: CommandParameters, vertices: &[LineVertex]) {
        let rc = RenderCommand(cmd.state.rc);
        let dither = rc.is_dithering_enabled() && DrawModeReg(cmd.state.draw_mode).dither_enable();
        let ctx = DrawContext::new(&cmd.state, params, self.drawing_area);
        let vram = &mut self.vram;

        for pair in vertices.windows(2) {
            specialize!(draw_line
                [rc.shading_enable(), rc.transparency_enable(), dither]
                (vram, &ctx, &pair[0], &pair[1]));
        }
    }

    fn clear_display(&mut self) {
        self.display_buffer.fill(0);
    }

    fn update_display(&mut self, params: &DisplayParams) {
        self.display = *params;

        if !params.is_enabled() {
            self.display_buffer.fill(0);
            return;
        }

        let vram_offset_y = params.display_vram_top as u32;
        let display_width = params.display_vram_width as u32;
        let display_height = params.display_vram_height as u32;
        let start_x = params.display_vram_start_x as u32;
        let texture_offset_x = (params.display_vram_left as u32).saturating_sub(start_x);
        let width = display_width + texture_offset_x;
        let stride = VRAM_WIDTH as usize;

        match params.interlaced_mode() {
            InterlacedDisplayMode::None => {
                if params.is_24bit() {
                    self.copy_out_24bit(start_x, vram_offset_y, 0, stride, width, display_height, false, false);
                } else {
                    self.copy_out_15bit(start_x, vram_offset_y, 0, stride, width, display_height, false, false);
                }
            }
            mode => {
                let field = (params.interlaced_display_field & 1) as u32;
                let interleaved = mode == InterlacedDisplayMode::InterleavedFields;
                let dst = field as usize * stride;
                if params.is_24bit() {
                    self.copy_out_24bit(
                        start_x,
                        vram_offset_y + field,
                        dst,
                        stride,
                        width,
                        display_height,
                        true,
                        interleaved,
                    );
                } else {
                    self.copy_out_15bit(
                        start_x,
                        vram_offset_y + field,
                        dst,
                        stride,
                        width,
                        display_height,
                        true,
                        interleaved,
                    );
                }
            }
        }
    }

    fn vram(&self) -> &Vram {
        &self.vram
    }

    fn vram_mut(&mut self) -> &mut Vram {
        &mut self.vram
    }

    fn drawing_area(&self) -> Rect<u16> {
        self.drawing_area
    }

    fn display_params(&self) -> DisplayParams {
        self.display
    }

    fn set_display_params(&mut self, params: DisplayParams) {
        self.display = params;
    }

    fn display_buffer(&self) -> &[u32] {
        &self.display_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{DrawState, PolygonVertex};

    fn full_area(renderer: &mut SoftwareRenderer) {
        renderer.set_drawing_area(Rect::new(0, 0, 1023, 511));
    }

    fn vertex(x: i32, y: i32) -> PolygonVertex {
        PolygonVertex {
            x,
            y,
            color: 0x0000_FF00,
            precise_w: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_quad_covers_rectangle() {
        let mut renderer = SoftwareRenderer::new();
        full_area(&mut renderer);
        let cmd = DrawPolygonCommand {
            state: DrawState {
                // Flat opaque quad
                rc: 0x2800_FF00,
                ..Default::default()
            },
            num_vertices: 4,
            ..Default::default()
        };
        let vertices = [vertex(10, 10), vertex(20, 10), vertex(10, 20), vertex(20, 20)];
        renderer.draw_polygon(&cmd, CommandParameters::empty(), &vertices);

        let covered = renderer.vram().pixels().iter().filter(|&&p| p == 0x03E0).count();
        assert_eq!(covered, 100);
        assert_eq!(renderer.vram().get(19, 19), 0x03E0);
        assert_eq!(renderer.vram().get(20, 19), 0);
    }

    #[test]
    fn test_polygon_with_too_few_vertices() {
        let mut renderer = SoftwareRenderer::new();
        full_area(&mut renderer);
        let cmd = DrawPolygonCommand::default();
        renderer.draw_polygon(&cmd, CommandParameters::empty(), &[vertex(0, 0)]);
        assert!(renderer.vram().pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_scanout_15bit() {
        let mut renderer = SoftwareRenderer::new();
        renderer.vram_mut().set(100, 50, 0x001F);
        let params = DisplayParams {
            display_aspect_ratio: 4.0 / 3.0,
            display_vram_left: 100,
            display_vram_top: 50,
            display_vram_width: 320,
            display_vram_height: 240,
            display_vram_start_x: 100,
            enabled: 1,
            ..Default::default()
        };
        renderer.update_display(&params);
        assert_eq!(renderer.display_buffer()[0], 0x0000_00FF);
        assert_eq!(renderer.display_params().display_vram_width, 320);
    }

    #[test]
    fn test_scanout_24bit_packs_three_bytes() {
        let mut renderer = SoftwareRenderer::new();
        // Bytes 11 22 33 44 55 66 on row 0
        renderer.vram_mut().set(0, 0, 0x2211);
        renderer.vram_mut().set(1, 0, 0x4433);
        renderer.vram_mut().set(2, 0, 0x6655);
        let params = DisplayParams {
            display_vram_width: 2,
            display_vram_height: 1,
            enabled: 1,
            display_24bit: 1,
            ..Default::default()
        };
        renderer.update_display(&params);
        assert_eq!(renderer.display_buffer()[0], 0xFF33_2211);
        assert_eq!(renderer.display_buffer()[1], 0xFF66_5544);
    }

    #[test]
    fn test_disabled_display_clears() {
        let mut renderer = SoftwareRenderer::new();
        renderer.vram_mut().set(0, 0, 0x7FFF);
        let mut params = DisplayParams {
            display_vram_width: 4,
            display_vram_height: 4,
            enabled: 1,
            ..Default::default()
        };
        renderer.update_display(&params);
        assert_ne!(renderer.display_buffer()[0], 0);
        params.enabled = 0;
        renderer.update_display(&params);
        assert_eq!(renderer.display_buffer()[0], 0);
    }
}
