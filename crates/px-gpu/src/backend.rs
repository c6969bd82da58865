//! GPU backend
//!
//! Consumes records produced by the command processor and applies them to a
//! [`Renderer`]. Records are handled inline on the emulation thread, or pushed
//! through the command ring to a dedicated worker.

use crate::commands::{BackendCommand, DisplayParams, SYNC_RECORD_SIZE};
use crate::queue::{command_queue, QueueConsumer, QueueCursors, QueueProducer, COMMAND_QUEUE_SIZE, THRESHOLD_TO_WAKE_GPU};
use crate::renderer::Renderer;
use crate::types::{InterlacedDisplayMode, Rect, VRAM_SIZE};
use parking_lot::Mutex;
use px_core::GpuError;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Renderer shared between the front end and the worker
pub type SharedRenderer = Arc<Mutex<Box<dyn Renderer>>>;

/// Size of a serialized backend state
pub const STATE_SIZE: usize = VRAM_SIZE + 4 * 4 + 4 + 10 * 2 + 4;

/// Backend worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendThreadState {
    /// Records are handled on the caller's thread
    Inline,
    Running,
    Stopped,
}

enum Mode {
    Inline,
    Threaded {
        producer: QueueProducer,
        worker: Option<JoinHandle<()>>,
    },
}

pub struct GpuBackend {
    renderer: SharedRenderer,
    mode: Mode,
    state: BackendThreadState,
}

impl GpuBackend {
    /// Create a backend, spawning the worker when `use_thread` is set
    pub fn new(renderer: Box<dyn Renderer>, use_thread: bool) -> Result<Self, GpuError> {
        if use_thread {
            Self::threaded(renderer, COMMAND_QUEUE_SIZE)
        } else {
            Ok(Self::inline(renderer))
        }
    }

    /// Backend that handles every record immediately
    pub fn inline(renderer: Box<dyn Renderer>) -> Self {
        tracing::info!("GpuBackend: using {} renderer on the emulation thread", renderer.name());
        Self {
            renderer: Arc::new(Mutex::new(renderer)),
            mode: Mode::Inline,
            state: BackendThreadState::Inline,
        }
    }

    /// Backend with a worker thread and a ring of `queue_capacity` bytes
    pub fn threaded(renderer: Box<dyn Renderer>, queue_capacity: usize) -> Result<Self, GpuError> {
        tracing::info!(
            "GpuBackend: using {} renderer on worker thread, {} byte queue",
            renderer.name(),
            queue_capacity
        );

        let renderer: SharedRenderer = Arc::new(Mutex::new(renderer));
        let (producer, consumer) = command_queue(queue_capacity);
        let worker_renderer = Arc::clone(&renderer);
        let worker = std::thread::Builder::new()
            .name("GPU Backend".to_string())
            .spawn(move || run_worker(consumer, worker_renderer))
            .map_err(|e| GpuError::Thread(e.to_string()))?;

        Ok(Self {
            renderer,
            mode: Mode::Threaded {
                producer,
                worker: Some(worker),
            },
            state: BackendThreadState::Running,
        })
    }

    pub fn state(&self) -> BackendThreadState {
        self.state
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.mode, Mode::Threaded { .. })
    }

    /// Ring cursors, or `None` in inline mode
    pub fn queue_cursors(&self) -> Option<QueueCursors> {
        match &self.mode {
            Mode::Inline => None,
            Mode::Threaded { producer, .. } => Some(producer.cursors()),
        }
    }

    /// Submit one record
    pub fn push_command(&mut self, command: &BackendCommand) {
        let producer = match &mut self.mode {
            Mode::Inline => {
                handle_command(self.renderer.lock().as_mut(), command);
                return;
            }
            Mode::Threaded { producer, .. } => producer,
        };

        if matches!(command, BackendCommand::Sync) {
            self.sync();
            return;
        }

        if !producer.try_push(command) {
            tracing::warn!(
                "GpuBackend: {} byte record does not fit, draining queue",
                command.encoded_size()
            );
            self.sync();

            let Mode::Threaded { producer, .. } = &mut self.mode else {
                return;
            };
            if !producer.try_push(command) {
                tracing::error!(
                    "GpuBackend: {:?} record of {} bytes exceeds queue capacity {}",
                    command.command_type(),
                    command.encoded_size(),
                    producer.capacity() - SYNC_RECORD_SIZE
                );
                return;
            }
        }

        let Mode::Threaded { producer, .. } = &mut self.mode else {
            return;
        };
        if matches!(command, BackendCommand::FrameDone) {
            producer.wake_consumer();
        } else if producer.pending() >= THRESHOLD_TO_WAKE_GPU && producer.is_consumer_sleeping() {
            producer.wake_consumer();
        }
    }

    /// Wait until the worker has handled every submitted record. The ring
    /// cursors are both 0 afterwards.
    pub fn sync(&mut self) {
        let Mode::Threaded { producer, worker } = &mut self.mode else {
            return;
        };
        if worker.is_none() {
            return;
        }
        producer.push_sync();
        producer.wake_consumer();
        producer.wait_for_sync();
    }

    /// Run `f` against the renderer once all queued work has landed
    pub fn with_renderer<R>(&mut self, f: impl FnOnce(&mut dyn Renderer) -> R) -> R {
        self.sync();
        let mut renderer = self.renderer.lock();
        f(renderer.as_mut())
    }

    /// Copy a VRAM rectangle, wrapping at the edges
    pub fn read_vram_rect(&mut self, x: u32, y: u32, width: u32, height: u32, out: &mut Vec<u16>) {
        self.with_renderer(|r| r.vram().read_rect(x, y, width, height, out));
    }

    pub fn display_params(&mut self) -> DisplayParams {
        self.with_renderer(|r| r.display_params())
    }

    /// Serialize VRAM, drawing area and display parameters, little-endian
    pub fn save_state(&mut self) -> Vec<u8> {
        self.with_renderer(|r| {
            let mut out = Vec::with_capacity(STATE_SIZE);
            for pixel in r.vram().pixels() {
                out.extend_from_slice(&pixel.to_le_bytes());
            }

            let area = r.drawing_area();
            for edge in [area.left, area.top, area.right, area.bottom] {
                out.extend_from_slice(&(edge as u32).to_le_bytes());
            }

            let d = r.display_params();
            out.extend_from_slice(&d.display_aspect_ratio.to_le_bytes());
            for value in [
                d.display_width,
                d.display_height,
                d.display_origin_left,
                d.display_origin_top,
                d.display_vram_left,
                d.display_vram_top,
                d.display_vram_width,
                d.display_vram_height,
                d.display_vram_start_x,
                d.display_vram_start_y,
            ] {
                out.extend_from_slice(&value.to_le_bytes());
            }
            out.extend_from_slice(&[
                d.interlaced_display_mode,
                d.interlaced_display_field,
                d.enabled,
                d.display_24bit,
            ]);
            out
        })
    }

    /// Restore a state written by [`GpuBackend::save_state`]
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), GpuError> {
        if data.len() < STATE_SIZE {
            return Err(GpuError::StateTruncated {
                needed: STATE_SIZE,
                available: data.len(),
            });
        }

        let (vram_bytes, rest) = data.split_at(VRAM_SIZE);
        let mut reader = StateReader { data: rest };
        let area = Rect::new(
            reader.u32() as u16,
            reader.u32() as u16,
            reader.u32() as u16,
            reader.u32() as u16,
        );

        let mut display = DisplayParams {
            display_aspect_ratio: f32::from_bits(reader.u32()),
            ..Default::default()
        };
        for field in [
            &mut display.display_width,
            &mut display.display_height,
            &mut display.display_origin_left,
            &mut display.display_origin_top,
            &mut display.display_vram_left,
            &mut display.display_vram_top,
            &mut display.display_vram_width,
            &mut display.display_vram_height,
            &mut display.display_vram_start_x,
            &mut display.display_vram_start_y,
        ] {
            *field = reader.u16();
        }
        display.interlaced_display_mode = reader.u8();
        display.interlaced_display_field = reader.u8();
        display.enabled = (reader.u8() != 0) as u8;
        display.display_24bit = (reader.u8() != 0) as u8;

        if InterlacedDisplayMode::from_u8(display.interlaced_display_mode).is_none() {
            return Err(GpuError::InvalidState(format!(
                "interlaced display mode {}",
                display.interlaced_display_mode
            )));
        }

        self.with_renderer(|r| {
            for (pixel, bytes) in r.vram_mut().pixels_mut().iter_mut().zip(vram_bytes.chunks_exact(2)) {
                *pixel = u16::from_le_bytes([bytes[0], bytes[1]]);
            }
            r.set_drawing_area(area);
            r.set_display_params(display);
        });

        tracing::debug!("GpuBackend: state loaded, drawing area {:?}", area);
        Ok(())
    }

    /// Drain the queue and stop the worker
    pub fn shutdown(&mut self) {
        let Mode::Threaded { producer, worker } = &mut self.mode else {
            return;
        };
        let Some(handle) = worker.take() else {
            return;
        };

        producer.push_sync();
        producer.wake_consumer();
        producer.wait_for_sync();
        producer.request_shutdown();
        if handle.join().is_err() {
            tracing::error!("GpuBackend: worker thread panicked");
        }
        self.state = BackendThreadState::Stopped;
        tracing::info!("GpuBackend: worker stopped");
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bounds-checked by the caller via `STATE_SIZE`
struct StateReader<'a> {
    data: &'a [u8],
}

impl StateReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        let n = N.min(self.data.len());
        bytes[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        bytes
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
}

fn run_worker(consumer: QueueConsumer, renderer: SharedRenderer) {
    tracing::info!("GpuBackend: worker started");
    loop {
        if consumer.read_offset() == consumer.write_offset() {
            if !consumer.sleep() {
                break;
            }
            continue;
        }
        process_commands(&consumer, &renderer);
    }
}

/// Handle records until the ring is empty or a frame boundary is reached
fn process_commands(consumer: &QueueConsumer, renderer: &SharedRenderer) {
    let mut renderer = renderer.lock();
    loop {
        let read = consumer.read_offset();
        let Some((command, size)) = consumer.record_at(read) else {
            return;
        };

        match command {
            BackendCommand::Sync => {
                consumer.reset_cursors();
                consumer.signal_sync();
            }
            BackendCommand::FrameDone => {
                consumer.set_read_offset(read + size);
                return;
            }
            command => {
                handle_command(renderer.as_mut(), &command);
                consumer.set_read_offset(read + size);
            }
        }
    }
}

/// Apply one record. Transfers and drawing area changes flush batched
/// drawing first.
pub fn handle_command(renderer: &mut dyn Renderer, command: &BackendCommand) {
    match *command {
        BackendCommand::Sync | BackendCommand::FrameDone => {}
        BackendCommand::Reset => renderer.reset(),
        BackendCommand::UpdateSettings => renderer.update_settings(),
        BackendCommand::UpdateResolutionScale(scale) => renderer.update_resolution_scale(scale),
        BackendCommand::ReadVram(rect) => {
            renderer.flush_render();
            renderer.read_vram(rect);
        }
        BackendCommand::FillVram(cmd, params) => {
            renderer.flush_render();
            renderer.fill_vram(cmd.rect, cmd.color, params);
        }
        BackendCommand::UpdateVram { rect, params, data } => {
            renderer.flush_render();
            renderer.update_vram(rect, data, params);
        }
        BackendCommand::CopyVram(cmd, params) => {
            renderer.flush_render();
            renderer.copy_vram(&cmd, params);
        }
        BackendCommand::SetDrawingArea(area) => {
            renderer.flush_render();
            renderer.set_drawing_area(area.into());
        }
        BackendCommand::DrawPolygon { cmd, params, vertices } => {
            renderer.draw_polygon(&cmd, params, vertices);
        }
        BackendCommand::DrawRectangle(cmd, params) => renderer.draw_rectangle(&cmd, params),
        BackendCommand::DrawLine { cmd, params, vertices } => {
            renderer.draw_line(&cmd, params, vertices);
        }
        BackendCommand::ClearDisplay => renderer.clear_display(),
        BackendCommand::UpdateDisplay(params) => renderer.update_display(&params),
        BackendCommand::FlushRender => renderer.flush_render(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{FillVramCommand, VramRect};
    use crate::renderer::SoftwareRenderer;
    use crate::types::CommandParameters;

    fn fill(x: u16, color: u32) -> BackendCommand<'static> {
        BackendCommand::FillVram(
            FillVramCommand {
                rect: VramRect {
                    x,
                    y: 0,
                    width: 16,
                    height: 1,
                },
                color,
                ..Default::default()
            },
            CommandParameters::empty(),
        )
    }

    #[test]
    fn test_inline_handles_immediately() {
        let mut backend = GpuBackend::inline(Box::new(SoftwareRenderer::new()));
        assert_eq!(backend.state(), BackendThreadState::Inline);
        backend.push_command(&fill(0, 0xFF));
        backend.push_command(&BackendCommand::Sync);
        assert!(backend.queue_cursors().is_none());
        let mut out = Vec::new();
        backend.read_vram_rect(0, 0, 1, 1, &mut out);
        assert_eq!(out, vec![0x001F]);
    }

    #[test]
    fn test_threaded_sync_resets_cursors() {
        let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 4096).unwrap();
        assert_eq!(backend.state(), BackendThreadState::Running);
        backend.push_command(&fill(0, 0xFF00));
        backend.sync();
        assert_eq!(backend.queue_cursors(), Some(QueueCursors { read: 0, write: 0 }));

        let mut out = Vec::new();
        backend.read_vram_rect(15, 0, 1, 1, &mut out);
        assert_eq!(out, vec![0x03E0]);
    }

    #[test]
    fn test_frame_done_is_processed() {
        let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 4096).unwrap();
        backend.push_command(&fill(32, 0xFF_0000));
        backend.push_command(&BackendCommand::FrameDone);
        backend.push_command(&fill(48, 0xFF_0000));
        let mut out = Vec::new();
        backend.read_vram_rect(32, 0, 32, 1, &mut out);
        assert!(out.iter().all(|&p| p == 0x7C00));
    }

    #[test]
    fn test_state_round_trip() {
        let mut backend = GpuBackend::inline(Box::new(SoftwareRenderer::new()));
        backend.push_command(&fill(100, 0x00FF_FFFF));
        backend.push_command(&BackendCommand::SetDrawingArea(Rect::new(1, 2, 300, 200).into()));
        let display = DisplayParams {
            display_aspect_ratio: 4.0 / 3.0,
            display_vram_width: 320,
            display_vram_height: 240,
            interlaced_display_mode: InterlacedDisplayMode::InterleavedFields as u8,
            enabled: 1,
            ..Default::default()
        };
        backend.push_command(&BackendCommand::UpdateDisplay(display));

        let state = backend.save_state();
        assert_eq!(state.len(), STATE_SIZE);

        let mut restored = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 1 << 16).unwrap();
        restored.load_state(&state).unwrap();
        assert_eq!(restored.display_params(), display);
        assert_eq!(restored.with_renderer(|r| r.drawing_area()), Rect::new(1, 2, 300, 200));
        assert_eq!(restored.save_state(), state);
    }

    #[test]
    fn test_truncated_state_rejected() {
        let mut backend = GpuBackend::inline(Box::new(SoftwareRenderer::new()));
        let err = backend.load_state(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, GpuError::StateTruncated { needed: STATE_SIZE, available: 16 }));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut backend = GpuBackend::threaded(Box::new(SoftwareRenderer::new()), 1024).unwrap();
        backend.push_command(&fill(0, 0xFF));
        backend.shutdown();
        assert_eq!(backend.state(), BackendThreadState::Stopped);
        backend.shutdown();
    }
}
