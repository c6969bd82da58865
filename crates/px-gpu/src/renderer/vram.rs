//! VRAM storage and the transfer operations shared by all renderers

use crate::types::{rgba8888_to_rgba5551, CommandParameters, VRAM_HEIGHT, VRAM_WIDTH};

/// 1024x512 16-bit pixels
pub struct Vram {
    pixels: Box<[u16]>,
}

impl Default for Vram {
    fn default() -> Self {
        Self::new()
    }
}

impl Vram {
    pub fn new() -> Self {
        Self {
            pixels: vec![0u16; (VRAM_WIDTH * VRAM_HEIGHT) as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.pixels[(y * VRAM_WIDTH + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u16) {
        self.pixels[(y * VRAM_WIDTH + x) as usize] = value;
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn row_mut(&mut self, y: u32) -> &mut [u16] {
        let start = ((y % VRAM_HEIGHT) * VRAM_WIDTH) as usize;
        &mut self.pixels[start..start + VRAM_WIDTH as usize]
    }

    /// Copy a wrapped rectangle out, row-major
    pub fn read_rect(&self, x: u32, y: u32, width: u32, height: u32, out: &mut Vec<u16>) {
        out.clear();
        out.reserve((width * height) as usize);
        for row in 0..height {
            let sy = (y + row) % VRAM_HEIGHT;
            for col in 0..width {
                out.push(self.get((x + col) % VRAM_WIDTH, sy));
            }
        }
    }

    /// Constant color fill. Ignores the mask bit but honours interlaced
    /// rendering.
    pub fn fill(&mut self, x: u32, y: u32, width: u32, height: u32, color: u32, params: CommandParameters) {
        let color16 = rgba8888_to_rgba5551(color);
        let interlaced = params.contains(CommandParameters::INTERLACED_RENDERING);

        if x + width <= VRAM_WIDTH && !interlaced {
            for yoffs in 0..height {
                let row = self.row_mut(y + yoffs);
                row[x as usize..(x + width) as usize].fill(color16);
            }
        } else if interlaced {
            let active_field = params.active_line_lsb();
            for yoffs in 0..height {
                let row = (y + yoffs) % VRAM_HEIGHT;
                if row & 1 == active_field {
                    continue;
                }
                let row = self.row_mut(row);
                for xoffs in 0..width {
                    row[((x + xoffs) % VRAM_WIDTH) as usize] = color16;
                }
            }
        } else {
            for yoffs in 0..height {
                let row = self.row_mut(y + yoffs);
                for xoffs in 0..width {
                    row[((x + xoffs) % VRAM_WIDTH) as usize] = color16;
                }
            }
        }
    }

    /// CPU to VRAM upload of `width * height` pixels
    pub fn update(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[u16], params: CommandParameters) {
        if width == 0 || height == 0 {
            return;
        }

        let width = width as usize;
        if (x as usize + width) <= VRAM_WIDTH as usize
            && y + height <= VRAM_HEIGHT
            && !params.is_masking_enabled()
        {
            for (row, src) in data.chunks_exact(width).take(height as usize).enumerate() {
                let dst = self.row_mut(y + row as u32);
                dst[x as usize..x as usize + width].copy_from_slice(src);
            }
            return;
        }

        let mask_and = params.mask_and();
        let mask_or = params.mask_or();
        for (row, src) in data.chunks_exact(width).take(height as usize).enumerate() {
            let dst = self.row_mut(y + row as u32);
            for (col, &pixel) in src.iter().enumerate() {
                let dst_pixel = &mut dst[((x + col as u32) % VRAM_WIDTH) as usize];
                if *dst_pixel & mask_and == 0 {
                    *dst_pixel = pixel | mask_or;
                }
            }
        }
    }

    /// VRAM to VRAM copy
    pub fn copy(
        &mut self,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
        params: CommandParameters,
    ) {
        // Copies crossing the right edge are split into unwrapped pieces
        if src_x + width > VRAM_WIDTH || dst_x + width > VRAM_WIDTH {
            let mut remaining_rows = height;
            let mut current_src_y = src_y;
            let mut current_dst_y = dst_y;
            while remaining_rows > 0 {
                let rows = remaining_rows
                    .min(VRAM_HEIGHT - current_src_y)
                    .min(VRAM_HEIGHT - current_dst_y);

                let mut remaining_columns = width;
                let mut current_src_x = src_x;
                let mut current_dst_x = dst_x;
                while remaining_columns > 0 {
                    let columns = remaining_columns
                        .min(VRAM_WIDTH - current_src_x)
                        .min(VRAM_WIDTH - current_dst_x);
                    self.copy(
                        current_src_x,
                        current_src_y,
                        current_dst_x,
                        current_dst_y,
                        columns,
                        rows,
                        params,
                    );
                    current_src_x = (current_src_x + columns) % VRAM_WIDTH;
                    current_dst_x = (current_dst_x + columns) % VRAM_WIDTH;
                    remaining_columns -= columns;
                }

                current_src_y = (current_src_y + rows) % VRAM_HEIGHT;
                current_dst_y = (current_dst_y + rows) % VRAM_HEIGHT;
                remaining_rows -= rows;
            }
            return;
        }

        let mask_and = params.mask_and();
        let mask_or = params.mask_or();

        // Hardware walks each row right to left when the source starts left
        // of the destination
        let reverse = src_x < dst_x
            || ((src_x + width).wrapping_sub(1) % VRAM_WIDTH) < ((dst_x + width).wrapping_sub(1) % VRAM_WIDTH);

        for row in 0..height {
            let sy = (src_y + row) % VRAM_HEIGHT;
            let dy = (dst_y + row) % VRAM_HEIGHT;
            let mut copy_pixel = |col: u32| {
                let src_pixel = self.get((src_x + col) % VRAM_WIDTH, sy);
                let dx = (dst_x + col) % VRAM_WIDTH;
                if self.get(dx, dy) & mask_and == 0 {
                    self.set(dx, dy, src_pixel | mask_or);
                }
            };

            if reverse {
                (0..width).rev().for_each(&mut copy_pixel);
            } else {
                (0..width).for_each(&mut copy_pixel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_wraps_horizontally() {
        let mut vram = Vram::new();
        vram.fill(1020, 0, 8, 1, 0x0000_00FF, CommandParameters::empty());
        assert_eq!(vram.get(1023, 0), 0x001F);
        assert_eq!(vram.get(3, 0), 0x001F);
        assert_eq!(vram.get(4, 0), 0);
    }

    #[test]
    fn test_fill_skips_active_field() {
        let mut vram = Vram::new();
        let params = CommandParameters::INTERLACED_RENDERING | CommandParameters::ACTIVE_LINE_LSB;
        vram.fill(0, 0, 2, 4, 0x00FF_FFFF, params);
        assert_eq!(vram.get(0, 0), 0x7FFF);
        assert_eq!(vram.get(0, 1), 0);
        assert_eq!(vram.get(0, 2), 0x7FFF);
        assert_eq!(vram.get(0, 3), 0);
    }

    #[test]
    fn test_fill_ignores_mask() {
        let mut vram = Vram::new();
        vram.set(0, 0, 0x8000);
        vram.fill(0, 0, 1, 1, 0x0000_00FF, CommandParameters::CHECK_MASK_BEFORE_DRAW);
        assert_eq!(vram.get(0, 0), 0x001F);
    }

    #[test]
    fn test_update_honours_mask() {
        let mut vram = Vram::new();
        vram.set(11, 5, 0x8001);
        let params = CommandParameters::CHECK_MASK_BEFORE_DRAW | CommandParameters::SET_MASK_WHILE_DRAWING;
        vram.update(10, 5, 3, 1, &[1, 2, 3], params);
        assert_eq!(vram.get(10, 5), 0x8001);
        assert_eq!(vram.get(11, 5), 0x8001);
        // The skipped pixel still consumes its source word
        assert_eq!(vram.get(12, 5), 0x8003);
    }

    #[test]
    fn test_update_wraps_vertically() {
        let mut vram = Vram::new();
        vram.update(0, 511, 2, 2, &[1, 2, 3, 4], CommandParameters::empty());
        assert_eq!(vram.get(1, 511), 2);
        assert_eq!(vram.get(0, 0), 3);
    }

    #[test]
    fn test_copy_overlapping_right() {
        let mut vram = Vram::new();
        for x in 0..8 {
            vram.set(x, 0, x as u16 + 1);
        }
        vram.copy(0, 0, 2, 0, 6, 1, CommandParameters::empty());
        let row: Vec<u16> = (0..8).map(|x| vram.get(x, 0)).collect();
        assert_eq!(row, vec![1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_splits_at_right_edge() {
        let mut vram = Vram::new();
        vram.set(1023, 0, 7);
        vram.set(0, 0, 8);
        vram.copy(1023, 0, 100, 10, 2, 1, CommandParameters::empty());
        assert_eq!(vram.get(100, 10), 7);
        assert_eq!(vram.get(101, 10), 8);
    }
}
