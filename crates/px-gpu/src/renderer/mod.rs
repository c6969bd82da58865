//! Rendering backends

pub mod line;
pub mod rectangle;
pub mod shade;
pub mod software;
pub mod triangle;
pub mod vram;

use crate::commands::{
    CopyVramCommand, DisplayParams, DrawLineCommand, DrawPolygonCommand, DrawRectangleCommand,
    LineVertex, PolygonVertex, VramRect,
};
use crate::types::{CommandParameters, Rect};

pub use software::SoftwareRenderer;
pub use vram::Vram;

/// Consumer of backend command records
pub trait Renderer: Send {
    /// Renderer name for logs
    fn name(&self) -> &str;

    /// Clear VRAM and display state
    fn reset(&mut self);

    /// Make `rect` current in the VRAM shadow before the CPU reads it back
    fn read_vram(&mut self, rect: VramRect);

    /// Fill a rectangle with an RGB888 color
    fn fill_vram(&mut self, rect: VramRect, color: u32, params: CommandParameters);

    /// Upload CPU pixels into VRAM
    fn update_vram(&mut self, rect: VramRect, data: &[u16], params: CommandParameters);

    /// Copy between two VRAM rectangles
    fn copy_vram(&mut self, cmd: &CopyVramCommand, params: CommandParameters);

    /// Set the inclusive clip rectangle for draws
    fn set_drawing_area(&mut self, area: Rect<u16>);

    fn draw_polygon(&mut self, cmd: &DrawPolygonCommand, params: CommandParameters, vertices: &[PolygonVertex]);

    fn draw_rectangle(&mut self, cmd: &DrawRectangleCommand, params: CommandParameters);

    fn draw_line(&mut self, cmd: &DrawLineCommand, params: CommandParameters, vertices: &[LineVertex]);

    /// Finish any batched drawing
    fn flush_render(&mut self) {}

    /// Re-read settings after a configuration change
    fn update_settings(&mut self) {}

    /// Internal resolution multiplier; the software renderer always runs at 1x
    fn update_resolution_scale(&mut self, _scale: u32) {}

    /// Blank the display output
    fn clear_display(&mut self);

    /// Latch new display parameters and scan out the visible area
    fn update_display(&mut self, params: &DisplayParams);

    fn vram(&self) -> &Vram;

    fn vram_mut(&mut self) -> &mut Vram;

    fn drawing_area(&self) -> Rect<u16>;

    fn display_params(&self) -> DisplayParams;

    /// Replace display parameters without scanning out, used by state loads
    fn set_display_params(&mut self, params: DisplayParams);

    /// RGBA8888 scanout, 1024 pixels per row
    fn display_buffer(&self) -> &[u32];
}
