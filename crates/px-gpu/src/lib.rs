//! PS1 GPU emulation for oxidized-psx
//!
//! The command processor in [`Gpu`] decodes GP0/GP1 writes into backend
//! records. A [`GpuBackend`] replays them on a [`Renderer`], either inline or
//! on a worker thread fed through a ring buffer. [`SoftwareRenderer`]
//! rasterizes into a 1024x512 VRAM bit-exactly.

pub mod backend;
pub mod commands;
pub mod fifo;
mod gp0;
pub mod gpu;
pub mod queue;
pub mod renderer;
pub mod types;

pub use backend::{BackendThreadState, GpuBackend, SharedRenderer};
pub use commands::{BackendCommand, DisplayParams};
pub use gpu::{BlitterState, Gpu, GpuStats};
pub use queue::{command_queue, QueueConsumer, QueueCursors, QueueProducer, COMMAND_QUEUE_SIZE};
pub use renderer::{Renderer, SoftwareRenderer, Vram};
pub use types::{CommandParameters, InterlacedDisplayMode, Rect};
