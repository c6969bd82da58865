//! GP0 command FIFO
//!
//! Entries keep the register address in the upper half and the written word
//! in the lower half, so DMA and MMIO writes share one queue.

use std::collections::VecDeque;

/// Capacity in words
pub const MAX_FIFO_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct GpuFifo {
    entries: VecDeque<u64>,
}

impl GpuFifo {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_FIFO_SIZE),
        }
    }

    /// Queue a word; returns false when the FIFO is full and the word was dropped
    pub fn push(&mut self, address: u32, data: u32) -> bool {
        if self.entries.len() >= MAX_FIFO_SIZE {
            return false;
        }
        self.entries.push_back(((address as u64) << 32) | data as u64);
        true
    }

    /// Data word `index` entries from the front
    #[inline]
    pub fn peek(&self, index: usize) -> u32 {
        self.entries.get(index).map_or(0, |&e| e as u32)
    }

    #[inline]
    pub fn pop(&mut self) -> u32 {
        self.entries.pop_front().map_or(0, |e| e as u32)
    }

    /// Discard `count` words from the front
    pub fn remove(&mut self, count: usize) {
        let count = count.min(self.entries.len());
        self.entries.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_FIFO_SIZE
    }

    pub fn space(&self) -> usize {
        MAX_FIFO_SIZE - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Hex listing of the queued words, for diagnostics
    pub fn dump(&self) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| format!("  [{:4}] 0x{:08x} (addr 0x{:x})", i, *e as u32, e >> 32))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
