//! Axis-aligned sprites and tiles

use super::shade::{shade_pixel, DrawContext};
use super::vram::Vram;
use crate::commands::DrawRectangleCommand;

/// Rectangles never dither. Texture coordinates wrap at 256 so large sprites
/// tile their texture page.
pub fn draw_rectangle<const TEXTURE: bool, const RAW: bool, const TRANSPARENCY: bool>(
    vram: &mut Vram,
    ctx: &DrawContext,
    cmd: &DrawRectangleCommand,
) {
    let (r, g, b) = (cmd.color as u8, (cmd.color >> 8) as u8, (cmd.color >> 16) as u8);
    let (origin_u, origin_v) = (cmd.texcoord as u8, (cmd.texcoord >> 8) as u8);

    for offset_y in 0..cmd.height as i32 {
        let y = cmd.y + offset_y;
        if !ctx.contains_y(y) || ctx.params.skips_line(y) {
            continue;
        }

        let v = origin_v.wrapping_add(offset_y as u8);

        for offset_x in 0..cmd.width as i32 {
            let x = cmd.x + offset_x;
            if !ctx.contains_x(x) {
                continue;
            }

            let u = origin_u.wrapping_add(offset_x as u8);
            shade_pixel::<TEXTURE, RAW, TRANSPARENCY, false>(vram, ctx, x as u32, y as u32, r, g, b, u, v);
        }
    }
}
