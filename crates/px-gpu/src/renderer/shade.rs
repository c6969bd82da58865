//! Per-pixel shading shared by every primitive

use super::vram::Vram;
use crate::commands::DrawState;
use crate::types::{
    CommandParameters, DrawModeReg, Rect, TextureMode, TexturePaletteReg, TextureWindow,
    TransparencyMode, DITHER_MATRIX, DITHER_MATRIX_SIZE, VRAM_HEIGHT, VRAM_WIDTH,
};

/// Inputs up to 511 cover modulated texels (31 * 255 >> 4)
pub const DITHER_LUT_SIZE: usize = 512;

pub type DitherLut = [[[u8; DITHER_LUT_SIZE]; DITHER_MATRIX_SIZE]; DITHER_MATRIX_SIZE];

const fn compute_dither_lut() -> DitherLut {
    let mut lut = [[[0u8; DITHER_LUT_SIZE]; DITHER_MATRIX_SIZE]; DITHER_MATRIX_SIZE];
    let mut i = 0;
    while i < DITHER_MATRIX_SIZE {
        let mut j = 0;
        while j < DITHER_MATRIX_SIZE {
            let mut value = 0;
            while value < DITHER_LUT_SIZE {
                let dithered = (value as i32 + DITHER_MATRIX[i][j]) >> 3;
                lut[i][j][value] = if dithered < 0 {
                    0
                } else if dithered > 31 {
                    31
                } else {
                    dithered as u8
                };
                value += 1;
            }
            j += 1;
        }
        i += 1;
    }
    lut
}

/// Channel value to 5 bits, indexed by [y & 3][x & 3][value]
pub static DITHER_LUT: DitherLut = compute_dither_lut();

/// Everything a primitive needs besides its vertices
#[derive(Debug, Clone, Copy)]
pub struct DrawContext {
    pub area: Rect<u16>,
    pub draw_mode: DrawModeReg,
    pub palette: TexturePaletteReg,
    pub window: TextureWindow,
    pub params: CommandParameters,
}

impl DrawContext {
    pub fn new(state: &DrawState, params: CommandParameters, area: Rect<u16>) -> Self {
        Self {
            area,
            draw_mode: DrawModeReg(state.draw_mode),
            palette: TexturePaletteReg(state.palette),
            window: state.window,
            params,
        }
    }

    #[inline]
    pub fn contains_x(&self, x: i32) -> bool {
        x >= self.area.left as i32 && x <= self.area.right as i32
    }

    #[inline]
    pub fn contains_y(&self, y: i32) -> bool {
        y >= self.area.top as i32 && y <= self.area.bottom as i32
    }
}

#[inline]
fn channel(pixel: u16, shift: u32) -> u16 {
    (pixel >> shift) & 0x1F
}

#[inline]
fn fetch_texel(vram: &Vram, ctx: &DrawContext, u: u8, v: u8) -> u16 {
    let base_x = ctx.draw_mode.texture_page_base_x();
    let base_y = ctx.draw_mode.texture_page_base_y();
    let page_y = (base_y + v as u32) % VRAM_HEIGHT;

    match ctx.draw_mode.texture_mode() {
        TextureMode::Palette4Bit => {
            let packed = vram.get((base_x + u as u32 / 4) % VRAM_WIDTH, page_y);
            let index = (packed >> ((u % 4) * 4)) & 0x0F;
            vram.get(
                (ctx.palette.x_base() + index as u32) % VRAM_WIDTH,
                ctx.palette.y_base(),
            )
        }
        TextureMode::Palette8Bit => {
            let packed = vram.get((base_x + u as u32 / 2) % VRAM_WIDTH, page_y);
            let index = (packed >> ((u % 2) * 8)) & 0xFF;
            vram.get(
                (ctx.palette.x_base() + index as u32) % VRAM_WIDTH,
                ctx.palette.y_base(),
            )
        }
        TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit => {
            vram.get((base_x + u as u32) % VRAM_WIDTH, page_y)
        }
    }
}

#[inline]
fn blend(mode: TransparencyMode, bg: u16, fg: u16) -> u16 {
    let mix = |f: fn(u16, u16) -> u16| {
        f(channel(bg, 0), channel(fg, 0))
            | (f(channel(bg, 5), channel(fg, 5)) << 5)
            | (f(channel(bg, 10), channel(fg, 10)) << 10)
            | (fg & 0x8000)
    };

    match mode {
        TransparencyMode::HalfBackgroundPlusHalfForeground => mix(|b, f| (b / 2 + f / 2).min(0x1F)),
        TransparencyMode::BackgroundPlusForeground => mix(|b, f| (b + f).min(0x1F)),
        TransparencyMode::BackgroundMinusForeground => mix(|b, f| b.saturating_sub(f)),
        TransparencyMode::BackgroundPlusQuarterForeground => mix(|b, f| (b + f / 4).min(0x1F)),
    }
}

/// Shade and write one pixel. `x`/`y` must already be inside VRAM.
#[inline(always)]
pub fn shade_pixel<const TEXTURE: bool, const RAW: bool, const TRANSPARENCY: bool, const DITHER: bool>(
    vram: &mut Vram,
    ctx: &DrawContext,
    x: u32,
    y: u32,
    r: u8,
    g: u8,
    b: u8,
    u: u8,
    v: u8,
) {
    let (dither_y, dither_x) = if DITHER {
        ((y & 3) as usize, (x & 3) as usize)
    } else {
        (2, 3)
    };
    let lut = &DITHER_LUT[dither_y][dither_x];

    let (color, transparent) = if TEXTURE {
        let (u, v) = ctx.window.apply(u, v);
        let texel = fetch_texel(vram, ctx, u, v);
        if texel == 0 {
            return;
        }

        let color = if RAW {
            texel
        } else {
            let modulate = |shift: u32, c: u8| -> u16 {
                lut[((channel(texel, shift) * c as u16) >> 4) as usize] as u16
            };
            modulate(0, r) | (modulate(5, g) << 5) | (modulate(10, b) << 10) | (texel & 0x8000)
        };
        (color, texel & 0x8000 != 0)
    } else {
        let color = lut[r as usize] as u16
            | ((lut[g as usize] as u16) << 5)
            | ((lut[b as usize] as u16) << 10);
        (color, true)
    };

    let bg = vram.get(x, y);
    let color = if TRANSPARENCY && transparent {
        blend(ctx.draw_mode.transparency_mode(), bg, color)
    } else {
        color
    };

    if bg & ctx.params.mask_and() != 0 {
        return;
    }
    vram.set(x, y, color | ctx.params.mask_or());
}
