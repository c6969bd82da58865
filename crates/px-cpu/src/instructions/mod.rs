//! Instruction implementations

pub mod branch;
pub mod integer;
pub mod load_store;
pub mod system;
