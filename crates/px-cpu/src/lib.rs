//! R3000A CPU emulation for oxidized-psx
//!
//! This crate implements the PS1's MIPS R3000A core and the code cache that
//! drives it.
//!
//! ## Execution Modes
//!
//! - **Interpreter**: one instruction at a time, nothing cached
//! - **CachedInterpreter**: decoded blocks are cached per pc and replayed
//!   through the interpreter (default)
//! - **Recompiler**: blocks are lowered to host code by a
//!   [`RecompilerBackend`] and executed natively, optionally with fastmem
//!
//! ## Usage
//!
//! ```ignore
//! use px_cpu::{CodeCache, Cpu};
//! use px_memory::Bus;
//!
//! let mut bus = Bus::new(&bios)?;
//! let mut cpu = Cpu::new(bus.interrupts().clone());
//! let mut cache = CodeCache::new(&config.cpu, &bus, None);
//!
//! cpu.downcount = cpu.pending_ticks + 564_480;
//! cache.execute(&mut cpu, &mut bus);
//! ```

pub mod block;
pub mod code_buffer;
pub mod code_cache;
pub mod cpu;
pub mod decoder;
pub mod fastmem;
pub mod instructions;
pub mod interpreter;
pub mod recompiler;

pub use block::{BlockId, CodeBlock, CodeBlockInstruction, CodeBlockKey, HostCode, InstructionFlags};
pub use code_buffer::CodeBuffer;
pub use code_cache::{CodeCache, CodeCacheStats};
pub use cpu::{Cpu, CpuRegisters, Exception};
pub use decoder::{CpuDecoder, DecodedInstruction, Instruction, Operation};
pub use recompiler::{BackpatchInfo, Backpatcher, CompiledBlock, RecompilerBackend};
