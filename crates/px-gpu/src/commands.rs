//! Backend command records
//!
//! Every record starts with an 8 byte [`CommandHeader`] holding its type,
//! parameter flags and total size. A fixed body follows, then an optional
//! trailing array (vertices or pixel data). Records are padded to 8 bytes so
//! the next header stays aligned inside the queue.

use crate::types::{CommandParameters, InterlacedDisplayMode, Rect, TextureWindow};
use bytemuck::{Pod, Zeroable};

/// Record alignment inside the queue
pub const RECORD_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Sync = 0,
    FrameDone,
    Reset,
    UpdateSettings,
    UpdateResolutionScale,
    ReadVram,
    FillVram,
    UpdateVram,
    CopyVram,
    SetDrawingArea,
    DrawPolygon,
    DrawRectangle,
    DrawLine,
    ClearDisplay,
    UpdateDisplay,
    FlushRender,
}

impl CommandType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Sync,
            1 => Self::FrameDone,
            2 => Self::Reset,
            3 => Self::UpdateSettings,
            4 => Self::UpdateResolutionScale,
            5 => Self::ReadVram,
            6 => Self::FillVram,
            7 => Self::UpdateVram,
            8 => Self::CopyVram,
            9 => Self::SetDrawingArea,
            10 => Self::DrawPolygon,
            11 => Self::DrawRectangle,
            12 => Self::DrawLine,
            13 => Self::ClearDisplay,
            14 => Self::UpdateDisplay,
            15 => Self::FlushRender,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CommandHeader {
    pub ty: u8,
    pub params: u8,
    pub _pad: [u8; 2],
    /// Total record size in bytes, header included
    pub size: u32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<CommandHeader>();

/// Size of a bare `Sync` record
pub const SYNC_RECORD_SIZE: usize = HEADER_SIZE;

/// VRAM rectangle used by read, fill and update records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct VramRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FillVramCommand {
    pub rect: VramRect,
    /// RGB888
    pub color: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CopyVramCommand {
    pub src_x: u16,
    pub src_y: u16,
    pub dst_x: u16,
    pub dst_y: u16,
    pub width: u16,
    pub height: u16,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawingAreaCommand {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl From<Rect<u16>> for DrawingAreaCommand {
    fn from(r: Rect<u16>) -> Self {
        Self {
            left: r.left,
            top: r.top,
            right: r.right,
            bottom: r.bottom,
        }
    }
}

impl From<DrawingAreaCommand> for Rect<u16> {
    fn from(c: DrawingAreaCommand) -> Self {
        Rect::new(c.left, c.top, c.right, c.bottom)
    }
}

/// State shared by every draw record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawState {
    /// Raw render command word
    pub rc: u32,
    pub draw_mode: u16,
    pub palette: u16,
    pub window: TextureWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawPolygonCommand {
    pub state: DrawState,
    pub num_vertices: u16,
    pub _pad: u16,
    /// Bounds touched by the primitive, for the dirty tracking of hardware
    /// renderers
    pub bounds: DrawingAreaCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct PolygonVertex {
    pub precise_x: f32,
    pub precise_y: f32,
    pub precise_w: f32,
    pub x: i32,
    pub y: i32,
    pub color: u32,
    /// u | v << 8
    pub texcoord: u16,
    pub _pad: u16,
}

impl PolygonVertex {
    pub fn u(&self) -> u8 {
        self.texcoord as u8
    }

    pub fn v(&self) -> u8 {
        (self.texcoord >> 8) as u8
    }

    pub fn r(&self) -> u8 {
        self.color as u8
    }

    pub fn g(&self) -> u8 {
        (self.color >> 8) as u8
    }

    pub fn b(&self) -> u8 {
        (self.color >> 16) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawRectangleCommand {
    pub state: DrawState,
    pub x: i32,
    pub y: i32,
    pub width: u16,
    pub height: u16,
    pub texcoord: u16,
    pub _pad: u16,
    pub color: u32,
    pub _pad2: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawLineCommand {
    pub state: DrawState,
    pub num_vertices: u16,
    pub _pad: u16,
    pub bounds: DrawingAreaCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct LineVertex {
    pub x: i32,
    pub y: i32,
    pub color: u32,
}

impl LineVertex {
    pub fn r(&self) -> u8 {
        self.color as u8
    }

    pub fn g(&self) -> u8 {
        (self.color >> 8) as u8
    }

    pub fn b(&self) -> u8 {
        (self.color >> 16) as u8
    }
}

/// Scanout configuration computed by the CRTC
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DisplayParams {
    pub display_aspect_ratio: f32,
    pub display_width: u16,
    pub display_height: u16,
    pub display_origin_left: u16,
    pub display_origin_top: u16,
    pub display_vram_left: u16,
    pub display_vram_top: u16,
    pub display_vram_width: u16,
    pub display_vram_height: u16,
    pub display_vram_start_x: u16,
    pub display_vram_start_y: u16,
    pub interlaced_display_mode: u8,
    pub interlaced_display_field: u8,
    pub enabled: u8,
    pub display_24bit: u8,
}

impl DisplayParams {
    pub fn interlaced_mode(&self) -> InterlacedDisplayMode {
        InterlacedDisplayMode::from_u8(self.interlaced_display_mode).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn is_24bit(&self) -> bool {
        self.display_24bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
struct ScaleCommand {
    scale: u32,
    _pad: u32,
}

/// A record as produced by the command processor or read back by the worker
#[derive(Debug, Clone, Copy)]
pub enum BackendCommand<'a> {
    Sync,
    FrameDone,
    Reset,
    UpdateSettings,
    UpdateResolutionScale(u32),
    ReadVram(VramRect),
    FillVram(FillVramCommand, CommandParameters),
    UpdateVram {
        rect: VramRect,
        params: CommandParameters,
        data: &'a [u16],
    },
    CopyVram(CopyVramCommand, CommandParameters),
    SetDrawingArea(DrawingAreaCommand),
    DrawPolygon {
        cmd: DrawPolygonCommand,
        params: CommandParameters,
        vertices: &'a [PolygonVertex],
    },
    DrawRectangle(DrawRectangleCommand, CommandParameters),
    DrawLine {
        cmd: DrawLineCommand,
        params: CommandParameters,
        vertices: &'a [LineVertex],
    },
    ClearDisplay,
    UpdateDisplay(DisplayParams),
    FlushRender,
}

#[inline]
fn align_up(size: usize) -> usize {
    (size + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

impl<'a> BackendCommand<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Sync => CommandType::Sync,
            Self::FrameDone => CommandType::FrameDone,
            Self::Reset => CommandType::Reset,
            Self::UpdateSettings => CommandType::UpdateSettings,
            Self::UpdateResolutionScale(_) => CommandType::UpdateResolutionScale,
            Self::ReadVram(_) => CommandType::ReadVram,
            Self::FillVram(..) => CommandType::FillVram,
            Self::UpdateVram { .. } => CommandType::UpdateVram,
            Self::CopyVram(..) => CommandType::CopyVram,
            Self::SetDrawingArea(_) => CommandType::SetDrawingArea,
            Self::DrawPolygon { .. } => CommandType::DrawPolygon,
            Self::DrawRectangle(..) => CommandType::DrawRectangle,
            Self::DrawLine { .. } => CommandType::DrawLine,
            Self::ClearDisplay => CommandType::ClearDisplay,
            Self::UpdateDisplay(_) => CommandType::UpdateDisplay,
            Self::FlushRender => CommandType::FlushRender,
        }
    }

    fn params(&self) -> CommandParameters {
        match self {
            Self::FillVram(_, p) | Self::CopyVram(_, p) | Self::DrawRectangle(_, p) => *p,
            Self::UpdateVram { params, .. }
            | Self::DrawPolygon { params, .. }
            | Self::DrawLine { params, .. } => *params,
            _ => CommandParameters::empty(),
        }
    }

    /// Body bytes followed by trailing array bytes
    fn parts(&self) -> (&[u8], &[u8]) {
        match self {
            Self::UpdateResolutionScale(_) => (&[], &[]),
            Self::ReadVram(rect) => (bytemuck::bytes_of(rect), &[]),
            Self::FillVram(cmd, _) => (bytemuck::bytes_of(cmd), &[]),
            Self::UpdateVram { rect, data, .. } => {
                (bytemuck::bytes_of(rect), bytemuck::cast_slice(data))
            }
            Self::CopyVram(cmd, _) => (bytemuck::bytes_of(cmd), &[]),
            Self::SetDrawingArea(area) => (bytemuck::bytes_of(area), &[]),
            Self::DrawPolygon { cmd, vertices, .. } => {
                (bytemuck::bytes_of(cmd), bytemuck::cast_slice(vertices))
            }
            Self::DrawRectangle(cmd, _) => (bytemuck::bytes_of(cmd), &[]),
            Self::DrawLine { cmd, vertices, .. } => {
                (bytemuck::bytes_of(cmd), bytemuck::cast_slice(vertices))
            }
            Self::UpdateDisplay(params) => (bytemuck::bytes_of(params), &[]),
            _ => (&[], &[]),
        }
    }

    /// Encoded size in bytes, a multiple of [`RECORD_ALIGNMENT`]
    pub fn encoded_size(&self) -> usize {
        if let Self::UpdateResolutionScale(_) = self {
            return HEADER_SIZE + std::mem::size_of::<ScaleCommand>();
        }
        let (body, array) = self.parts();
        align_up(HEADER_SIZE + body.len() + array.len())
    }

    /// Write the record into `out`, which must hold `encoded_size()` bytes
    pub fn encode(&self, out: &mut [u8]) {
        let size = self.encoded_size();
        let header = CommandHeader {
            ty: self.command_type() as u8,
            params: self.params().bits(),
            _pad: [0; 2],
            size: size as u32,
        };
        out[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

        if let Self::UpdateResolutionScale(scale) = self {
            let body = ScaleCommand {
                scale: *scale,
                _pad: 0,
            };
            out[HEADER_SIZE..size].copy_from_slice(bytemuck::bytes_of(&body));
            return;
        }

        let (body, array) = self.parts();
        let mut offset = HEADER_SIZE;
        out[offset..offset + body.len()].copy_from_slice(body);
        offset += body.len();
        out[offset..offset + array.len()].copy_from_slice(array);
        offset += array.len();
        out[offset..size].fill(0);
    }

    /// Decode the record at the start of `bytes`. Returns the command and its
    /// encoded size, or `None` when the bytes do not hold a valid record.
    pub fn decode(bytes: &'a [u8]) -> Option<(Self, usize)> {
        let header: CommandHeader = read_body(bytes)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size % RECORD_ALIGNMENT != 0 || size > bytes.len() {
            return None;
        }
        let ty = CommandType::from_u8(header.ty)?;
        let params = CommandParameters::from_bits_truncate(header.params);
        let payload = &bytes[HEADER_SIZE..size];

        let command = match ty {
            CommandType::Sync => Self::Sync,
            CommandType::FrameDone => Self::FrameDone,
            CommandType::Reset => Self::Reset,
            CommandType::UpdateSettings => Self::UpdateSettings,
            CommandType::UpdateResolutionScale => {
                let body: ScaleCommand = read_body(payload)?;
                Self::UpdateResolutionScale(body.scale)
            }
            CommandType::ReadVram => Self::ReadVram(read_body(payload)?),
            CommandType::FillVram => Self::FillVram(read_body(payload)?, params),
            CommandType::UpdateVram => {
                let rect: VramRect = read_body(payload)?;
                let count = rect.width as usize * rect.height as usize;
                let data = read_array(payload, std::mem::size_of::<VramRect>(), count)?;
                Self::UpdateVram { rect, params, data }
            }
            CommandType::CopyVram => Self::CopyVram(read_body(payload)?, params),
            CommandType::SetDrawingArea => Self::SetDrawingArea(read_body(payload)?),
            CommandType::DrawPolygon => {
                let cmd: DrawPolygonCommand = read_body(payload)?;
                let vertices = read_array(
                    payload,
                    std::mem::size_of::<DrawPolygonCommand>(),
                    cmd.num_vertices as usize,
                )?;
                Self::DrawPolygon {
                    cmd,
                    params,
                    vertices,
                }
            }
            CommandType::DrawRectangle => Self::DrawRectangle(read_body(payload)?, params),
            CommandType::DrawLine => {
                let cmd: DrawLineCommand = read_body(payload)?;
                let vertices = read_array(
                    payload,
                    std::mem::size_of::<DrawLineCommand>(),
                    cmd.num_vertices as usize,
                )?;
                Self::DrawLine {
                    cmd,
                    params,
                    vertices,
                }
            }
            CommandType::ClearDisplay => Self::ClearDisplay,
            CommandType::UpdateDisplay => Self::UpdateDisplay(read_body(payload)?),
            CommandType::FlushRender => Self::FlushRender,
        };

        Some((command, size))
    }
}

fn read_body<T: Pod>(payload: &[u8]) -> Option<T> {
    bytemuck::try_pod_read_unaligned(payload.get(..std::mem::size_of::<T>())?).ok()
}

fn read_array<T: Pod>(payload: &[u8], offset: usize, count: usize) -> Option<&[T]> {
    let len = count.checked_mul(std::mem::size_of::<T>())?;
    let bytes = payload.get(offset..offset.checked_add(len)?)?;
    bytemuck::try_cast_slice(bytes).ok()
}
