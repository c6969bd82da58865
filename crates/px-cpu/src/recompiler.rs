//! Recompiler backend contract
//!
//! Machine code generation is architecture specific and lives outside this
//! crate. A backend lowers a [`CodeBlock`] into the [`CodeBuffer`], reports
//! the fast memory access sites it emitted so faults on them can be patched,
//! and knows how to enter the code it produced.

use crate::block::{CodeBlock, HostCode};
use crate::code_buffer::CodeBuffer;
use crate::cpu::Cpu;
use px_core::error::CpuError;
use px_memory::Bus;
use std::sync::Arc;

/// Worst case near code bytes emitted per guest instruction
pub const MAX_NEAR_HOST_BYTES_PER_INSTRUCTION: usize = 64;

/// Worst case far code bytes emitted per guest instruction
pub const MAX_FAR_HOST_BYTES_PER_INSTRUCTION: usize = 128;

/// A fast memory access site in emitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpatchInfo {
    /// Host address of the faulting load/store instruction
    pub host_pc: usize,
    /// Bytes of host code the fixup may rewrite
    pub host_code_size: usize,
    /// Guest instruction the access belongs to
    pub guest_pc: u32,
    /// Backend private data, e.g. the slow path thunk address
    pub data: usize,
}

/// Result of compiling one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlock {
    pub code: HostCode,
    pub backpatches: Vec<BackpatchInfo>,
}

/// Rewrites a fast access site into its slow, always checked form.
///
/// Called from fault context with the code cache suspended mid-block, so
/// implementations must not allocate or take locks the faulting thread may
/// hold.
pub trait Backpatcher: Send + Sync {
    fn backpatch(&self, info: &BackpatchInfo) -> bool;
}

/// Native code generator
pub trait RecompilerBackend: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Lower `block` into `buffer`. Returns [`CpuError::OutOfCodeSpace`] when
    /// the buffer fills up mid-block.
    fn compile(&mut self, block: &CodeBlock, buffer: &mut CodeBuffer) -> Result<CompiledBlock, CpuError>;

    /// Run compiled code. On return the CPU state reflects the block's
    /// effects, including any exception it raised.
    fn execute(&mut self, code: HostCode, cpu: &mut Cpu, bus: &mut Bus);

    /// Fixup applier shared with the fault handler
    fn backpatcher(&self) -> Arc<dyn Backpatcher>;
}

/// Space a block of `instructions` may need in the near and far regions
pub fn worst_case_code_size(instructions: usize) -> (usize, usize) {
    (
        instructions * MAX_NEAR_HOST_BYTES_PER_INSTRUCTION,
        instructions * MAX_FAR_HOST_BYTES_PER_INSTRUCTION,
    )
}
