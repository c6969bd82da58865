//! Worker thread and ring buffer behavior under load

use px_gpu::commands::{FillVramCommand, VramRect};
use px_gpu::{BackendCommand, BackendThreadState, CommandParameters, GpuBackend, QueueCursors, SoftwareRenderer};

fn fill(x: u16, y: u16, color: u32) -> BackendCommand<'static> {
    BackendCommand::FillVram(
        FillVramCommand {
            rect: VramRect {
                x,
                y,
                width: 16,
                height: 1,
            },
            color,
            ..Default::default()
        },
        CommandParameters::empty(),
    )
}

fn rgb555(color: u32) -> u16 {
    let r = (color & 0xFF) >> 3;
    let g = ((color >> 8) & 0xFF) >> 3;
    let b = ((color >> 16) & 0xFF) >> 3;
    (r | (g << 5) | (b << 10)) as u16
}

#[test]
fn test_small_ring_drains_without_corruption() {
    // Room for only a handful of records, so the producer keeps hitting the end
    let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 256).unwrap();

    for i in 0..2000u32 {
        let x = ((i % 64) * 16) as u16;
        let y = (i / 64) as u16;
        backend.push_command(&fill(x, y, (i * 0x0001_0305) & 0x00FF_FFFF));
    }
    backend.sync();
    assert_eq!(backend.queue_cursors(), Some(QueueCursors { read: 0, write: 0 }));

    let mut row = Vec::new();
    for i in 0..2000u32 {
        let x = (i % 64) * 16;
        let y = i / 64;
        backend.read_vram_rect(x, y, 16, 1, &mut row);
        let expected = rgb555((i * 0x0001_0305) & 0x00FF_FFFF);
        assert!(row.iter().all(|&p| p == expected), "fill {} at ({}, {})", i, x, y);
    }
}

#[test]
fn test_upload_records_survive_ring_pressure() {
    let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 1024).unwrap();
    let data: Vec<u16> = (0..64u16).collect();

    for row in 0..200u16 {
        backend.push_command(&BackendCommand::UpdateVram {
            rect: VramRect {
                x: 0,
                y: row,
                width: 64,
                height: 1,
            },
            params: CommandParameters::empty(),
            data: &data,
        });
    }

    let mut out = Vec::new();
    backend.read_vram_rect(0, 199, 64, 1, &mut out);
    assert_eq!(out, data);
    backend.read_vram_rect(0, 0, 64, 1, &mut out);
    assert_eq!(out, data);
}

#[test]
fn test_frame_boundaries_keep_order() {
    let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 4096).unwrap();
    for frame in 0..50u32 {
        backend.push_command(&fill(0, 0, frame));
        backend.push_command(&BackendCommand::FrameDone);
    }

    let mut out = Vec::new();
    backend.read_vram_rect(0, 0, 1, 1, &mut out);
    assert_eq!(out, vec![rgb555(49)]);
}

#[test]
fn test_shutdown_stops_worker() {
    let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 4096).unwrap();
    backend.push_command(&fill(0, 0, 0xFF));
    assert_eq!(backend.state(), BackendThreadState::Running);
    backend.shutdown();
    assert_eq!(backend.state(), BackendThreadState::Stopped);
}
