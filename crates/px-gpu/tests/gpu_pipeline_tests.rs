//! GP0 command streams through the command processor and software renderer

use px_core::config::GpuConfig;
use px_gpu::{BlitterState, Gpu};
use px_memory::{AccessSize, InterruptController, IoDevice};
use std::sync::Arc;

fn new_gpu(use_thread: bool) -> Gpu {
    let config = GpuConfig {
        use_thread,
        max_run_ahead: i32::MAX as u32,
        ..Default::default()
    };
    Gpu::new(&config, false, Arc::new(InterruptController::new())).unwrap()
}

fn gp0(gpu: &mut Gpu, words: &[u32]) {
    for &word in words {
        gpu.write_gp0(word);
    }
}

fn open_drawing_area(gpu: &mut Gpu) {
    gp0(gpu, &[0xE300_0000, 0xE400_0000 | (511 << 10) | 1023]);
}

/// Read a rectangle back through GP0(C0h) and GPUREAD
fn read_back(gpu: &mut Gpu, x: u32, y: u32, width: u32, height: u32) -> Vec<u16> {
    gp0(gpu, &[0xC000_0000, (y << 16) | x, (height << 16) | width]);
    let mut pixels = Vec::new();
    while gpu.blitter_state() == BlitterState::ReadingVram {
        let word = gpu.read_gpuread();
        pixels.push(word as u16);
        pixels.push((word >> 16) as u16);
    }
    pixels.truncate((width * height) as usize);
    pixels
}

#[test]
fn test_fill_then_read_back() {
    let mut gpu = new_gpu(false);
    gp0(&mut gpu, &[0x0200_FF00, 0, (4 << 16) | 16]);
    let pixels = read_back(&mut gpu, 0, 0, 4, 4);
    assert_eq!(pixels, vec![0x03E0; 16]);
}

#[test]
fn test_fill_then_read_back_threaded() {
    let mut gpu = new_gpu(true);
    gp0(&mut gpu, &[0x0200_FF00, 0, (4 << 16) | 16]);
    let pixels = read_back(&mut gpu, 0, 0, 4, 4);
    assert_eq!(pixels, vec![0x03E0; 16]);
}

#[test]
fn test_register_access_through_io_device() {
    let mut gpu = new_gpu(false);
    for word in [0x0200_00FF, 0, (1 << 16) | 16] {
        gpu.write(0, word, AccessSize::Word);
    }
    for word in [0xC000_0000, 0, (1 << 16) | 2] {
        gpu.write(0, word, AccessSize::Word);
    }
    assert_ne!(gpu.read(4, AccessSize::Word) & (1 << 27), 0);
    assert_eq!(gpu.read(0, AccessSize::Word), 0x001F_001F);
    assert_eq!(gpu.read(4, AccessSize::Word) & (1 << 27), 0);
}

#[test]
fn test_adjacent_triangles_share_edge_exactly() {
    let mut gpu = new_gpu(false);
    open_drawing_area(&mut gpu);
    // Additive blending: any overlap shows up as 2, any gap as 0
    gp0(&mut gpu, &[0xE100_0020]);
    gp0(&mut gpu, &[0x2200_0008, 0, 32, 32 << 16]);
    gp0(&mut gpu, &[0x2200_0008, 32, 32 << 16, (32 << 16) | 32]);

    let pixels = read_back(&mut gpu, 0, 0, 40, 40);
    for y in 0..40 {
        for x in 0..40 {
            let expected = if x < 32 && y < 32 { 1 } else { 0 };
            assert_eq!(pixels[y * 40 + x], expected, "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn test_overlapping_copy_moves_right_to_left() {
    let mut gpu = new_gpu(false);
    // Ramp 1..=8 on row 0
    gp0(&mut gpu, &[0xA000_0000, 0, (1 << 16) | 8]);
    gp0(&mut gpu, &[0x0002_0001, 0x0004_0003, 0x0006_0005, 0x0008_0007]);
    // Shift right by two pixels onto itself
    gp0(&mut gpu, &[0x8000_0000, 0, 2, (1 << 16) | 8]);

    let pixels = read_back(&mut gpu, 0, 0, 10, 1);
    assert_eq!(pixels, vec![1, 2, 1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_overlapping_copy_moves_left_to_right() {
    let mut gpu = new_gpu(false);
    gp0(&mut gpu, &[0xA000_0000, 2, (1 << 16) | 8]);
    gp0(&mut gpu, &[0x0002_0001, 0x0004_0003, 0x0006_0005, 0x0008_0007]);
    gp0(&mut gpu, &[0x8000_0000, 2, 0, (1 << 16) | 8]);

    let pixels = read_back(&mut gpu, 0, 0, 10, 1);
    assert_eq!(pixels, vec![1, 2, 3, 4, 5, 6, 7, 8, 7, 8]);
}

#[test]
fn test_polyline_draws_every_segment() {
    let mut gpu = new_gpu(false);
    open_drawing_area(&mut gpu);
    // L shape: (0,10) -> (20,10) -> (20,0)
    gp0(&mut gpu, &[0x4800_FF00, 10 << 16, (10 << 16) | 20, 20, 0x5555_5555]);
    assert_eq!(gpu.blitter_state(), BlitterState::Idle);

    let row = read_back(&mut gpu, 0, 10, 21, 1);
    assert!(row.iter().all(|&p| p == 0x03E0));
    let column = read_back(&mut gpu, 20, 0, 1, 11);
    assert!(column.iter().all(|&p| p == 0x03E0));
    assert_eq!(read_back(&mut gpu, 10, 5, 1, 1), vec![0]);
}

#[test]
fn test_mask_check_protects_pixels() {
    let mut gpu = new_gpu(false);
    open_drawing_area(&mut gpu);
    // Set the mask bit while filling a sprite, then draw over it with checking on
    gp0(&mut gpu, &[0xE600_0001, 0x6000_00FF, 0, (4 << 16) | 4]);
    gp0(&mut gpu, &[0xE600_0002, 0x6000_FF00, (2 << 16) | 2, (4 << 16) | 4]);

    let pixels = read_back(&mut gpu, 0, 0, 6, 6);
    assert_eq!(pixels[0], 0x801F);
    assert_eq!(pixels[2 * 6 + 2], 0x801F);
    assert_eq!(pixels[5 * 6 + 5], 0x03E0);
}

#[test]
fn test_display_scanout_after_frame() {
    let mut gpu = new_gpu(true);
    gp0(&mut gpu, &[0x0200_00FF, 0, (240 << 16) | 256]);
    gpu.write_gp1(0x0300_0000);
    gpu.end_frame();

    let buffer = gpu.display_buffer();
    assert_eq!(buffer[0], 0x0000_00FF);
    assert_eq!(gpu.stats().num_vram_fills, 1);
    assert_eq!(gpu.current_stats().num_vram_fills, 0);
}

#[test]
fn test_save_state_round_trip() {
    let mut source = new_gpu(false);
    open_drawing_area(&mut source);
    gp0(&mut source, &[0x0200_1F00, (8 << 16) | 16, (8 << 16) | 16]);
    let state = source.save_state();

    let mut target = new_gpu(true);
    target.load_state(&state).unwrap();
    assert_eq!(target.drawing_area(), source.drawing_area());
    assert_eq!(read_back(&mut target, 16, 8, 1, 1), read_back(&mut source, 16, 8, 1, 1));
    assert!(target.load_state(&state[..100]).is_err());
}
