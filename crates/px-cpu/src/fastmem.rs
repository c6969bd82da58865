//! Fault driven fast memory access
//!
//! With fastmem active, recompiled loads and stores touch the host RAM
//! mapping directly and code pages are mapped read-only. The handler here
//! turns the resulting protection faults back into code cache bookkeeping:
//! writes to code pages are flagged for invalidation, and faults on emitted
//! access sites are repaired by the backend's backpatcher.

use crate::block::BlockId;
use crate::recompiler::{BackpatchInfo, Backpatcher};
use parking_lot::Mutex;
use px_core::error::MemoryError;
use px_memory::fault::{self, FaultInfo, HandlerResult};
use px_memory::{ram_code_page_index, PageState, Ram};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Emitted code of one block
#[derive(Debug, Clone)]
pub struct HostCodeEntry {
    pub block: BlockId,
    pub size: usize,
    pub backpatches: Vec<BackpatchInfo>,
}

/// Host code entry address to block, shared with the fault handler
pub type HostCodeMap = Arc<Mutex<BTreeMap<usize, HostCodeEntry>>>;

/// Everything the fault handler may touch
pub struct FastmemState {
    ram: Arc<Ram>,
    host_code: HostCodeMap,
    backpatcher: Arc<dyn Backpatcher>,
    /// Mirror of SR.IsC; isolated stores never reach RAM
    cache_isolated: AtomicBool,
}

impl FastmemState {
    pub fn new(ram: Arc<Ram>, host_code: HostCodeMap, backpatcher: Arc<dyn Backpatcher>) -> Self {
        Self {
            ram,
            host_code,
            backpatcher,
            cache_isolated: AtomicBool::new(false),
        }
    }

    pub fn set_cache_isolated(&self, isolated: bool) {
        self.cache_isolated.store(isolated, Ordering::Relaxed);
    }

    /// Classify and repair a fault. Only atomics, `mprotect` and a
    /// non-blocking map lookup happen here.
    pub fn handle_fault(&self, info: &FaultInfo) -> HandlerResult {
        if let Some(offset) = self.ram.offset_of_host(info.fault_address) {
            let page = ram_code_page_index(offset);
            let state = self.ram.page_state(page);
            if info.is_write
                && !self.cache_isolated.load(Ordering::Relaxed)
                && state.intersects(PageState::CODE | PageState::PROTECTED)
            {
                self.ram.notify_code_write(page);
                return HandlerResult::ContinueExecution;
            }
        }

        let Some(mut map) = self.host_code.try_lock() else {
            return HandlerResult::ExecuteNextHandler;
        };
        let Some((&entry_addr, entry)) = map.range_mut(..=info.exception_pc).next_back() else {
            return HandlerResult::ExecuteNextHandler;
        };
        if info.exception_pc >= entry_addr + entry.size {
            return HandlerResult::ExecuteNextHandler;
        }

        let Some(index) = entry
            .backpatches
            .iter()
            .position(|bp| bp.host_pc == info.exception_pc)
        else {
            return HandlerResult::ExecuteNextHandler;
        };

        if !self.backpatcher.backpatch(&entry.backpatches[index]) {
            return HandlerResult::ExecuteNextHandler;
        }
        entry.backpatches.swap_remove(index);
        HandlerResult::ContinueExecution
    }
}

/// Keeps the code cache's fault handler registered while alive
pub struct FastmemGuard {
    owner: usize,
    state: Arc<FastmemState>,
}

impl FastmemGuard {
    /// Register the handler. Fails when the host can't intercept faults.
    pub fn install(state: FastmemState) -> Result<Self, MemoryError> {
        let state = Arc::new(state);
        let owner = Arc::as_ptr(&state) as *const u8 as usize;
        let handler_state = Arc::clone(&state);
        fault::install_handler(owner, Arc::new(move |info: &FaultInfo| {
            handler_state.handle_fault(info)
        }))?;
        Ok(Self { owner, state })
    }

    pub fn state(&self) -> &FastmemState {
        &self.state
    }
}

impl Drop for FastmemGuard {
    fn drop(&mut self) {
        fault::remove_handler(self.owner);
    }
}
