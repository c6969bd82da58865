//! Major-axis line walker

use super::shade::{shade_pixel, DrawContext};
use super::vram::Vram;
use crate::commands::LineVertex;
use crate::types::{MAX_PRIMITIVE_HEIGHT, MAX_PRIMITIVE_WIDTH, VRAM_HEIGHT_MASK};

const XY_FRACT_BITS: u32 = 32;
const RGB_FRACT_BITS: u32 = 12;

#[inline]
fn line_divide(delta: i32, dk: i32) -> i64 {
    let mut delta = ((delta as i64 as u64) << XY_FRACT_BITS) as i64;
    if delta < 0 {
        delta -= (dk - 1) as i64;
    }
    if delta > 0 {
        delta += (dk - 1) as i64;
    }
    delta / dk as i64
}

#[inline]
fn color_step(c0: u8, c1: u8, k: i32) -> u32 {
    ((((c1 as i32 - c0 as i32) as u32) << RGB_FRACT_BITS) as i32 / k) as u32
}

#[inline]
fn color_start(c: u8) -> u32 {
    ((c as u32) << RGB_FRACT_BITS) | (1 << (RGB_FRACT_BITS - 1))
}

/// Draw one segment. Zero-length segments plot a single pixel.
pub fn draw_line<const SHADING: bool, const TRANSPARENCY: bool, const DITHER: bool>(
    vram: &mut Vram,
    ctx: &DrawContext,
    p0: &LineVertex,
    p1: &LineVertex,
) {
    let i_dx = (p1.x - p0.x).abs();
    let i_dy = (p1.y - p0.y).abs();
    let k = i_dx.max(i_dy);
    if i_dx as u32 >= MAX_PRIMITIVE_WIDTH || i_dy as u32 >= MAX_PRIMITIVE_HEIGHT {
        return;
    }

    let (p0, p1) = if p0.x >= p1.x && k > 0 { (p1, p0) } else { (p0, p1) };

    let (dx_dk, dy_dk, dr_dk, dg_dk, db_dk) = if k == 0 {
        (0, 0, 0, 0, 0)
    } else if SHADING {
        (
            line_divide(p1.x - p0.x, k),
            line_divide(p1.y - p0.y, k),
            color_step(p0.r(), p1.r(), k),
            color_step(p0.g(), p1.g(), k),
            color_step(p0.b(), p1.b(), k),
        )
    } else {
        (line_divide(p1.x - p0.x, k), line_divide(p1.y - p0.y, k), 0, 0, 0)
    };

    let half = 1u64 << (XY_FRACT_BITS - 1);
    let mut cur_x = ((p0.x as i64 as u64) << XY_FRACT_BITS) | half;
    let mut cur_y = ((p0.y as i64 as u64) << XY_FRACT_BITS) | half;
    cur_x = cur_x.wrapping_sub(1024);
    if dy_dk < 0 {
        cur_y = cur_y.wrapping_sub(1024);
    }

    let (mut cur_r, mut cur_g, mut cur_b) = (color_start(p0.r()), color_start(p0.g()), color_start(p0.b()));

    for _ in 0..=k {
        let x = ((cur_x >> XY_FRACT_BITS) & 2047) as i32;
        let y = ((cur_y >> XY_FRACT_BITS) & 2047) as i32;

        if !ctx.params.skips_line(y) && ctx.contains_x(x) && ctx.contains_y(y) {
            let (r, g, b) = if SHADING {
                (
                    (cur_r >> RGB_FRACT_BITS) as u8,
                    (cur_g >> RGB_FRACT_BITS) as u8,
                    (cur_b >> RGB_FRACT_BITS) as u8,
                )
            } else {
                (p0.r(), p0.g(), p0.b())
            };
            shade_pixel::<false, false, TRANSPARENCY, DITHER>(
                vram,
                ctx,
                x as u32,
                y as u32 & VRAM_HEIGHT_MASK,
                r,
                g,
                b,
                0,
                0,
            );
        }

        cur_x = cur_x.wrapping_add(dx_dk as u64);
        cur_y = cur_y.wrapping_add(dy_dk as u64);
        if SHADING {
            cur_r = cur_r.wrapping_add(dr_dk);
            cur_g = cur_g.wrapping_add(dg_dk);
            cur_b = cur_b.wrapping_add(db_dk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandParameters, DrawModeReg, Rect, TexturePaletteReg, TextureWindow};

    fn ctx() -> DrawContext {
        DrawContext {
            area: Rect::new(0, 0, 1023, 511),
            draw_mode: DrawModeReg(0),
            palette: TexturePaletteReg(0),
            window: TextureWindow::default(),
            params: CommandParameters::empty(),
        }
    }

    fn lv(x: i32, y: i32, color: u32) -> LineVertex {
        LineVertex { x, y, color }
    }

    #[test]
    fn test_horizontal_line_includes_both_ends() {
        let mut vram = Vram::new();
        draw_line::<false, false, false>(&mut vram, &ctx(), &lv(10, 5, 0xFF), &lv(20, 5, 0xFF));
        for x in 10..=20 {
            assert_eq!(vram.get(x, 5), 0x1F, "pixel {}", x);
        }
        assert_eq!(vram.get(9, 5), 0);
        assert_eq!(vram.get(21, 5), 0);
    }

    #[test]
    fn test_reversed_endpoints_match() {
        let mut a = Vram::new();
        let mut b = Vram::new();
        draw_line::<false, false, false>(&mut a, &ctx(), &lv(3, 2, 0xFF), &lv(40, 17, 0xFF));
        draw_line::<false, false, false>(&mut b, &ctx(), &lv(40, 17, 0xFF), &lv(3, 2, 0xFF));
        assert!(a.pixels() == b.pixels());
    }

    #[test]
    fn test_zero_length_line_plots_point() {
        let mut vram = Vram::new();
        draw_line::<false, false, false>(&mut vram, &ctx(), &lv(7, 7, 0xFF), &lv(7, 7, 0xFF));
        assert_eq!(vram.get(7, 7), 0x1F);
        assert_eq!(vram.pixels().iter().filter(|&&p| p != 0).count(), 1);
    }

    #[test]
    fn test_vertical_line_covers_every_row() {
        let mut vram = Vram::new();
        draw_line::<false, false, false>(&mut vram, &ctx(), &lv(0, 0, 0xFF), &lv(0, 9, 0xFF));
        assert_eq!(vram.pixels().iter().filter(|&&p| p != 0).count(), 10);
    }

    #[test]
    fn test_oversized_line_is_culled() {
        let mut vram = Vram::new();
        draw_line::<false, false, false>(&mut vram, &ctx(), &lv(0, 0, 0xFF), &lv(1024, 0, 0xFF));
        assert!(vram.pixels().iter().all(|&p| p == 0));
    }
}
