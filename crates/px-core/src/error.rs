//! Error types for the oxidized-psx emulator

use thiserror::Error;

/// Main error type for the emulator
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("CPU error: {0}")]
    Cpu(#[from] CpuError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid executable: {0}")]
    InvalidExecutable(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Memory-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("Access violation at 0x{addr:08x}: {kind}")]
    AccessViolation { addr: u32, kind: AccessKind },

    #[error("Alignment error: address 0x{addr:08x} not aligned to {align}")]
    AlignmentError { addr: u32, align: u32 },

    #[error("Failed to change page protection at offset 0x{0:08x}")]
    ProtectionFailed(u32),

    #[error("Fault handler error: {0}")]
    FaultHandler(String),
}

/// CPU and code cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    #[error("Invalid instruction at 0x{addr:08x}: 0x{opcode:08x}")]
    InvalidInstruction { addr: u32, opcode: u32 },

    #[error("Failed to allocate code buffer of {0} bytes")]
    CodeBufferAllocation(usize),

    #[error("Code buffer exhausted")]
    OutOfCodeSpace,

    #[error("Block compilation failed at 0x{pc:08x}: {reason}")]
    CompileFailed { pc: u32, reason: String },
}

/// GPU errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("Save state truncated: needed {needed} bytes, {available} available")]
    StateTruncated { needed: usize, available: usize },

    #[error("Invalid save state: {0}")]
    InvalidState(String),

    #[error("Backend thread error: {0}")]
    Thread(String),
}

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;
