//! System integration for oxidized-psx
//!
//! Ties the bus, CPU, code cache and GPU together and drives them one video
//! frame at a time.

pub mod exe;
pub mod system;

pub use exe::ExeHeader;
pub use system::{System, FRAME_TICKS_NTSC, FRAME_TICKS_PAL};
