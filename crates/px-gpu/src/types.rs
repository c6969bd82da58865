//! GPU register layouts, constants and pixel helpers

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

pub const VRAM_WIDTH: u32 = 1024;
pub const VRAM_HEIGHT: u32 = 512;
pub const VRAM_SIZE: usize = (VRAM_WIDTH * VRAM_HEIGHT) as usize * 2;
pub const VRAM_WIDTH_MASK: u32 = VRAM_WIDTH - 1;
pub const VRAM_HEIGHT_MASK: u32 = VRAM_HEIGHT - 1;
pub const VRAM_COORD_MASK: u32 = 0x3FF;
pub const TEXTURE_PAGE_WIDTH: u32 = 256;
pub const TEXTURE_PAGE_HEIGHT: u32 = 256;
pub const MAX_PRIMITIVE_WIDTH: u32 = 1024;
pub const MAX_PRIMITIVE_HEIGHT: u32 = 512;
pub const DITHER_MATRIX_SIZE: usize = 4;

/// Signed offsets added to 8-bit channels before truncating to 5 bits
pub const DITHER_MATRIX: [[i32; DITHER_MATRIX_SIZE]; DITHER_MATRIX_SIZE] = [
    [-4, 0, -3, 1],
    [2, -2, 3, -1],
    [-3, 1, -4, 0],
    [4, -1, 2, -2],
];

/// Primitive class encoded in bits 29-31 of a render command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Reserved,
    Polygon,
    Line,
    Rectangle,
}

/// Fixed rectangle sizes, bits 27-28 of a rectangle command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectangleSize {
    Variable,
    R1x1,
    R8x8,
    R16x16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureMode {
    Palette4Bit,
    Palette8Bit,
    Direct16Bit,
    ReservedDirect16Bit,
}

impl TextureMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Palette4Bit,
            1 => Self::Palette8Bit,
            2 => Self::Direct16Bit,
            _ => Self::ReservedDirect16Bit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparencyMode {
    HalfBackgroundPlusHalfForeground,
    BackgroundPlusForeground,
    BackgroundMinusForeground,
    BackgroundPlusQuarterForeground,
}

impl TransparencyMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::HalfBackgroundPlusHalfForeground,
            1 => Self::BackgroundPlusForeground,
            2 => Self::BackgroundMinusForeground,
            _ => Self::BackgroundPlusQuarterForeground,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterlacedDisplayMode {
    #[default]
    None = 0,
    InterleavedFields = 1,
    SeparateFields = 2,
}

impl InterlacedDisplayMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::InterleavedFields),
            2 => Some(Self::SeparateFields),
            _ => None,
        }
    }
}

/// First word of a GP0 draw command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderCommand(pub u32);

impl RenderCommand {
    pub fn color_for_first_vertex(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Not valid for lines
    pub fn raw_texture_enable(self) -> bool {
        self.0 & (1 << 24) != 0
    }

    pub fn transparency_enable(self) -> bool {
        self.0 & (1 << 25) != 0
    }

    pub fn texture_enable(self) -> bool {
        self.0 & (1 << 26) != 0
    }

    pub fn rectangle_size(self) -> RectangleSize {
        match (self.0 >> 27) & 3 {
            0 => RectangleSize::Variable,
            1 => RectangleSize::R1x1,
            2 => RectangleSize::R8x8,
            _ => RectangleSize::R16x16,
        }
    }

    /// Shares bit 27 with `polyline` and the rectangle size
    pub fn quad_polygon(self) -> bool {
        self.0 & (1 << 27) != 0
    }

    pub fn polyline(self) -> bool {
        self.0 & (1 << 27) != 0
    }

    pub fn shading_enable(self) -> bool {
        self.0 & (1 << 28) != 0
    }

    pub fn primitive(self) -> Primitive {
        match self.0 >> 29 {
            1 => Primitive::Polygon,
            2 => Primitive::Line,
            3 => Primitive::Rectangle,
            _ => Primitive::Reserved,
        }
    }

    pub fn is_texturing_enabled(self) -> bool {
        self.primitive() != Primitive::Line && self.texture_enable()
    }

    /// Whether the primitive type dithers at all; the draw mode bit still
    /// has to allow it
    pub fn is_dithering_enabled(self) -> bool {
        match self.primitive() {
            Primitive::Polygon => {
                self.shading_enable() || (self.texture_enable() && !self.raw_texture_enable())
            }
            Primitive::Line => true,
            _ => false,
        }
    }
}

/// Signed 11-bit vertex coordinates packed as x | y << 16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexPosition(pub u32);

impl VertexPosition {
    pub fn x(self) -> i32 {
        sign_extend_12(self.0)
    }

    pub fn y(self) -> i32 {
        sign_extend_12(self.0 >> 16)
    }
}

#[inline]
fn sign_extend_12(value: u32) -> i32 {
    ((value << 20) as i32) >> 20
}

/// Clip a rectangle/sprite coordinate to the hardware's 11 bits
#[inline]
pub fn truncate_vertex_position(x: i32) -> i32 {
    (x << 21) >> 21
}

/// GP0(E1h) and the texpage half of textured polygons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawModeReg(pub u16);

impl DrawModeReg {
    pub const MASK: u16 = 0b1_1111_1111_1111;
    pub const TEXTURE_PAGE_MASK: u16 = 0b1_1111;
    /// Polygon texpage attributes only touch bits 0-8 and 11
    pub const POLYGON_TEXPAGE_MASK: u16 = 0b0000_1001_1111_1111;
    /// Bits mirrored into GPUSTAT
    pub const GPUSTAT_MASK: u32 = 0b111_1111_1111;

    pub fn texture_page_x_base(self) -> u32 {
        (self.0 & 0xF) as u32
    }

    pub fn texture_page_y_base(self) -> u32 {
        ((self.0 >> 4) & 1) as u32
    }

    pub fn transparency_mode(self) -> TransparencyMode {
        TransparencyMode::from_bits((self.0 >> 5) as u32)
    }

    pub fn texture_mode(self) -> TextureMode {
        TextureMode::from_bits((self.0 >> 7) as u32)
    }

    pub fn dither_enable(self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn draw_to_displayed_field(self) -> bool {
        self.0 & (1 << 10) != 0
    }

    pub fn texture_disable(self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn set_texture_disable(&mut self, disable: bool) {
        if disable {
            self.0 |= 1 << 11;
        } else {
            self.0 &= !(1 << 11);
        }
    }

    pub fn texture_x_flip(self) -> bool {
        self.0 & (1 << 12) != 0
    }

    pub fn texture_y_flip(self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn texture_page_base_x(self) -> u32 {
        self.texture_page_x_base() * 64
    }

    pub fn texture_page_base_y(self) -> u32 {
        self.texture_page_y_base() * 256
    }

    pub fn is_using_palette(self) -> bool {
        self.0 & (2 << 7) == 0
    }

    /// VRAM area the current texture page covers
    pub fn texture_page_rectangle(self) -> Rect<u32> {
        const WIDTHS: [u32; 4] = [
            TEXTURE_PAGE_WIDTH / 4,
            TEXTURE_PAGE_WIDTH / 2,
            TEXTURE_PAGE_WIDTH,
            TEXTURE_PAGE_WIDTH,
        ];
        let width = WIDTHS[((self.0 >> 7) & 3) as usize];
        Rect::from_extents(
            self.texture_page_base_x(),
            self.texture_page_base_y(),
            width,
            TEXTURE_PAGE_HEIGHT,
        )
    }
}

/// CLUT location, upper half of the first texcoord word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TexturePaletteReg(pub u16);

impl TexturePaletteReg {
    pub const MASK: u16 = 0x7FFF;

    pub fn x_base(self) -> u32 {
        (self.0 & 0x3F) as u32 * 16
    }

    pub fn y_base(self) -> u32 {
        ((self.0 >> 6) & 0x1FF) as u32
    }
}

/// GP0(E2h) texture window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureWindowReg(pub u32);

impl TextureWindowReg {
    pub const MASK: u32 = 0xF_FFFF;

    pub fn mask_x(self) -> u8 {
        (self.0 & 0x1F) as u8
    }

    pub fn mask_y(self) -> u8 {
        ((self.0 >> 5) & 0x1F) as u8
    }

    pub fn offset_x(self) -> u8 {
        ((self.0 >> 10) & 0x1F) as u8
    }

    pub fn offset_y(self) -> u8 {
        ((self.0 >> 15) & 0x1F) as u8
    }

    /// AND/OR pair applied to texture coordinates
    pub fn window(self) -> TextureWindow {
        TextureWindow {
            and_x: !(self.mask_x() << 3),
            and_y: !(self.mask_y() << 3),
            or_x: (self.offset_x() & self.mask_x()) << 3,
            or_y: (self.offset_y() & self.mask_y()) << 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TextureWindow {
    pub and_x: u8,
    pub and_y: u8,
    pub or_x: u8,
    pub or_y: u8,
}

impl Default for TextureWindow {
    fn default() -> Self {
        TextureWindowReg::default().window()
    }
}

impl TextureWindow {
    #[inline]
    pub fn apply(&self, u: u8, v: u8) -> (u8, u8) {
        ((u & self.and_x) | self.or_x, (v & self.and_y) | self.or_y)
    }
}

bitflags! {
    /// Per-record flags copied from GPUSTAT when the record is built
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandParameters: u8 {
        const INTERLACED_RENDERING = 1 << 0;
        /// Set when the displayed field is on odd VRAM lines
        const ACTIVE_LINE_LSB = 1 << 1;
        const SET_MASK_WHILE_DRAWING = 1 << 2;
        const CHECK_MASK_BEFORE_DRAW = 1 << 3;
    }
}

impl CommandParameters {
    pub fn is_masking_enabled(self) -> bool {
        self.intersects(Self::SET_MASK_WHILE_DRAWING | Self::CHECK_MASK_BEFORE_DRAW)
    }

    /// A pixel is written only if `dst & mask_and == 0`
    pub fn mask_and(self) -> u16 {
        if self.contains(Self::CHECK_MASK_BEFORE_DRAW) {
            0x8000
        } else {
            0
        }
    }

    /// Or-ed into every written pixel
    pub fn mask_or(self) -> u16 {
        if self.contains(Self::SET_MASK_WHILE_DRAWING) {
            0x8000
        } else {
            0
        }
    }

    pub fn active_line_lsb(self) -> u32 {
        self.contains(Self::ACTIVE_LINE_LSB) as u32
    }

    /// Whether row `y` belongs to the field being displayed and must be skipped
    #[inline]
    pub fn skips_line(self, y: i32) -> bool {
        self.contains(Self::INTERLACED_RENDERING) && (y as u32 & 1) == self.active_line_lsb()
    }
}

/// Inclusive-exclusive rectangle; the drawing area uses inclusive corners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect<T> {
    pub left: T,
    pub top: T,
    pub right: T,
    pub bottom: T,
}

impl<T: Copy + PartialOrd + std::ops::Add<Output = T>> Rect<T> {
    pub fn new(left: T, top: T, right: T, bottom: T) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_extents(left: T, top: T, width: T, height: T) -> Self {
        Self::new(left, top, left + width, top + height)
    }

    /// Left <= right and top <= bottom
    pub fn is_valid(&self) -> bool {
        self.left <= self.right && self.top <= self.bottom
    }
}

impl Rect<u16> {
    /// Marks the rectangle empty so that `include` starts fresh
    pub fn set_invalid(&mut self) {
        *self = Self::new(u16::MAX, u16::MAX, 0, 0);
    }

    pub fn include(&mut self, left: u16, top: u16, right: u16, bottom: u16) {
        self.left = self.left.min(left);
        self.top = self.top.min(top);
        self.right = self.right.max(right);
        self.bottom = self.bottom.max(bottom);
    }
}

#[inline]
pub fn min_max<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if a > b {
        (b, a)
    } else {
        (a, b)
    }
}

/// Expand a 5-5-5-1 VRAM pixel to RGBA8888, replicating the high bits
pub fn rgba5551_to_rgba8888(color: u16) -> u32 {
    let expand = |c: u16| -> u32 {
        let c = (c & 31) as u32;
        (c << 3) | (c & 7)
    };
    let r = expand(color);
    let g = expand(color >> 5);
    let b = expand(color >> 10);
    let a = if color & 0x8000 != 0 { 0xFF } else { 0 };
    r | (g << 8) | (b << 16) | (a << 24)
}

/// Truncate RGBA8888 to a 5-5-5-1 VRAM pixel
pub fn rgba8888_to_rgba5551(color: u32) -> u16 {
    let r = (color >> 3) & 0x1F;
    let g = (color >> 11) & 0x1F;
    let b = (color >> 19) & 0x1F;
    let a = (color >> 31) & 1;
    (r | (g << 5) | (b << 10) | (a << 15)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_command_decoding() {
        // Shaded textured quad
        let rc = RenderCommand(0x3C00_00FF);
        assert_eq!(rc.primitive(), Primitive::Polygon);
        assert!(rc.quad_polygon());
        assert!(rc.shading_enable());
        assert!(rc.texture_enable());
        assert_eq!(rc.color_for_first_vertex(), 0xFF);

        let line = RenderCommand(0x4800_0000);
        assert_eq!(line.primitive(), Primitive::Line);
        assert!(line.polyline());
        assert!(line.is_dithering_enabled());

        let rect = RenderCommand(0x7C00_0000);
        assert_eq!(rect.primitive(), Primitive::Rectangle);
        assert_eq!(rect.rectangle_size(), RectangleSize::R16x16);
        assert!(!rect.is_dithering_enabled());
        assert_eq!(RenderCommand(0x7400_0000).rectangle_size(), RectangleSize::R8x8);
    }

    #[test]
    fn test_vertex_position_sign_extension() {
        let vp = VertexPosition(0xFFFF_0010);
        assert_eq!(vp.x(), 16);
        assert_eq!(vp.y(), -1);
        assert_eq!(VertexPosition(0x0800_0800).x(), -2048);
        assert_eq!(truncate_vertex_position(1024), -1024);
        assert_eq!(truncate_vertex_position(1023), 1023);
    }

    #[test]
    fn test_texture_window() {
        // mask 0x1F, offset 0x01 on both axes
        let reg = TextureWindowReg(0x1F | (0x1F << 5) | (0x01 << 10) | (0x01 << 15));
        let window = reg.window();
        assert_eq!(window.and_x, !0xF8u8);
        assert_eq!(window.or_x, 0x08);
        assert_eq!(window.apply(0xFF, 0x00), (0x0F, 0x08));
    }

    #[test]
    fn test_texture_window_mask_and_offset() {
        // x: mask 3, offset 2. y: mask 0x10, offset 0x1F (only the masked bit survives)
        let reg = TextureWindowReg(0x03 | (0x10 << 5) | (0x02 << 10) | (0x1F << 15));
        let window = reg.window();
        assert_eq!((window.and_x, window.or_x), (0xE7, 0x10));
        assert_eq!((window.and_y, window.or_y), (0x7F, 0x80));
        assert_eq!(window.apply(0x3F, 0x05), (0x37, 0x85));
        assert_eq!(window.apply(0x00, 0xC5), (0x10, 0xC5));
    }

    #[test]
    fn test_color_conversion() {
        assert_eq!(rgba8888_to_rgba5551(0x0000_FF00), 0x03E0);
        assert_eq!(rgba5551_to_rgba8888(0x03E0), 0x0000_FF00);
        assert_eq!(rgba5551_to_rgba8888(0x8000), 0xFF00_0000);
    }

    #[test]
    fn test_mask_parameters() {
        let params = CommandParameters::CHECK_MASK_BEFORE_DRAW;
        assert_eq!(params.mask_and(), 0x8000);
        assert_eq!(params.mask_or(), 0);
        assert!(params.is_masking_enabled());

        let interlaced = CommandParameters::INTERLACED_RENDERING | CommandParameters::ACTIVE_LINE_LSB;
        assert!(interlaced.skips_line(3));
        assert!(!interlaced.skips_line(4));
        assert!(!CommandParameters::ACTIVE_LINE_LSB.skips_line(3));
    }

    #[test]
    fn test_draw_mode_texture_page() {
        let mode = DrawModeReg(0x0013 | (1 << 7));
        assert_eq!(mode.texture_page_base_x(), 192);
        assert_eq!(mode.texture_page_base_y(), 256);
        assert_eq!(mode.texture_mode(), TextureMode::Palette8Bit);
        assert!(mode.is_using_palette());
        assert_eq!(mode.texture_page_rectangle(), Rect::new(192, 256, 320, 512));
    }
}
