//! Memory subsystem for oxidized-psx PS1 emulator
//!
//! This crate provides the guest physical bus, the host mapping of main RAM
//! with per-page code tracking, and the process-wide fault handler registry
//! used by fastmem.

pub mod bus;
pub mod constants;
pub mod fault;
pub mod pages;
pub mod ram;

pub use bus::{AccessSize, Bus, Interrupt, InterruptController, IoDevice, SharedIoDevice};
pub use constants::*;
pub use fault::{FaultHandler, FaultInfo, HandlerResult};
pub use pages::{PageState, PageTable};
pub use ram::Ram;
