//! Code cache
//!
//! Owns every [`CodeBlock`], the RAM page to block index used for
//! self-modifying code detection, the link graph between blocks and the host
//! code map shared with the fastmem fault handler. Blocks live in an arena and
//! refer to each other by [`BlockId`], so unlinking and eviction never leave
//! dangling references.
//!
//! Guest writes to code pages (through the bus or through a fastmem fault)
//! only flag the page dirty. Dirty pages are drained into
//! [`CodeCache::invalidate_page`] before the next block is dispatched.

use crate::block::{decode_block, BlockId, CodeBlock, CodeBlockKey, HostCode, InstructionFlags};
use crate::code_buffer::CodeBuffer;
use crate::cpu::Cpu;
use crate::decoder::CpuDecoder;
use crate::fastmem::{FastmemGuard, FastmemState, HostCodeEntry, HostCodeMap};
use crate::recompiler::{worst_case_code_size, BackpatchInfo, CompiledBlock, RecompilerBackend};
use indexmap::IndexSet;
use parking_lot::Mutex;
use px_core::config::{CpuConfig, CpuExecutionMode};
use px_core::error::CpuError;
use px_memory::{Bus, Ram, RAM_CODE_PAGE_COUNT};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Follow recorded successors before falling back to a table lookup
pub const USE_BLOCK_LINKING: bool = true;

/// Code cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub blocks_compiled: u64,
    pub blocks_executed: u64,
    pub revalidations: u64,
    pub recompilations: u64,
    pub invalidated_pages: u64,
    pub links_made: u64,
    pub uncached_fallbacks: u64,
    pub flushes: u64,
}

/// Block cache and execution driver
pub struct CodeCache {
    mode: CpuExecutionMode,
    block_linking: bool,

    blocks: Vec<Option<CodeBlock>>,
    free_ids: Vec<usize>,
    block_map: HashMap<CodeBlockKey, BlockId>,
    ram_block_map: Vec<IndexSet<BlockId>>,
    host_code: HostCodeMap,

    backend: Option<Box<dyn RecompilerBackend>>,
    code_buffer: Option<CodeBuffer>,
    fastmem: Option<FastmemGuard>,

    ram: Arc<Ram>,
    dirty_pages: Vec<usize>,
    /// Bumped on every full flush so stale ids can be detected
    generation: u64,
    stats: CodeCacheStats,
}

impl CodeCache {
    /// Create a cache for `bus`'s RAM.
    ///
    /// Recompiler mode needs `backend` and a code buffer; fastmem needs the
    /// recompiler and a working fault handler. Missing pieces downgrade the
    /// mode with a warning instead of failing.
    pub fn new(config: &CpuConfig, bus: &Bus, backend: Option<Box<dyn RecompilerBackend>>) -> Self {
        let ram = Arc::clone(bus.ram());
        let host_code: HostCodeMap = Arc::new(Mutex::new(BTreeMap::new()));

        let mut mode = config.execution_mode;
        let mut code_buffer = None;
        if mode == CpuExecutionMode::Recompiler {
            match &backend {
                Some(b) => match CodeBuffer::with_default_size() {
                    Ok(buffer) => {
                        tracing::info!("Using recompiler backend '{}'", b.name());
                        code_buffer = Some(buffer);
                    }
                    Err(e) => {
                        tracing::warn!("{}, using the cached interpreter", e);
                        mode = CpuExecutionMode::CachedInterpreter;
                    }
                },
                None => {
                    tracing::warn!("No recompiler backend available, using the cached interpreter");
                    mode = CpuExecutionMode::CachedInterpreter;
                }
            }
        }

        let fastmem = match (&backend, config.fastmem) {
            (_, false) => None,
            (Some(b), true) if mode == CpuExecutionMode::Recompiler => {
                Self::install_fastmem(&ram, &host_code, b.as_ref())
            }
            _ => {
                tracing::warn!("Fastmem requires the recompiler, using checked memory access");
                None
            }
        };

        tracing::debug!(
            "Code cache: {:?}, block linking {}, fastmem {}",
            mode,
            config.block_linking,
            fastmem.is_some()
        );

        Self {
            mode,
            block_linking: config.block_linking,
            blocks: Vec::new(),
            free_ids: Vec::new(),
            block_map: HashMap::new(),
            ram_block_map: vec![IndexSet::new(); RAM_CODE_PAGE_COUNT],
            host_code,
            backend: if mode == CpuExecutionMode::Recompiler {
                backend
            } else {
                None
            },
            code_buffer,
            fastmem,
            ram,
            dirty_pages: Vec::new(),
            generation: 0,
            stats: CodeCacheStats::default(),
        }
    }

    fn install_fastmem(
        ram: &Arc<Ram>,
        host_code: &HostCodeMap,
        backend: &dyn RecompilerBackend,
    ) -> Option<FastmemGuard> {
        if !ram.set_write_protection(true) {
            tracing::warn!("Host can't write protect guest code pages, using checked memory access");
            return None;
        }

        let state = FastmemState::new(Arc::clone(ram), Arc::clone(host_code), backend.backpatcher());
        match FastmemGuard::install(state) {
            Ok(guard) => {
                tracing::info!("Fastmem enabled");
                Some(guard)
            }
            Err(e) => {
                tracing::warn!("{}, using checked memory access", e);
                ram.set_write_protection(false);
                None
            }
        }
    }

    /// Effective execution mode
    pub fn mode(&self) -> CpuExecutionMode {
        self.mode
    }

    pub fn is_fastmem_active(&self) -> bool {
        self.fastmem.is_some()
    }

    pub fn stats(&self) -> &CodeCacheStats {
        &self.stats
    }

    /// Number of live blocks
    pub fn block_count(&self) -> usize {
        self.block_map.len()
    }

    pub fn block(&self, id: BlockId) -> Option<&CodeBlock> {
        self.blocks.get(id.0).and_then(Option::as_ref)
    }

    fn block_mut(&mut self, id: BlockId) -> Option<&mut CodeBlock> {
        self.blocks.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Block stored for `key`, without compiling or revalidating
    pub fn lookup(&self, key: CodeBlockKey) -> Option<BlockId> {
        self.block_map.get(&key).copied()
    }

    /// Blocks currently indexed under a RAM page
    pub fn blocks_in_page(&self, page: usize) -> impl Iterator<Item = BlockId> + '_ {
        self.ram_block_map[page % RAM_CODE_PAGE_COUNT].iter().copied()
    }

    /// Host code entries, for diagnostics and tests
    pub fn host_code_map(&self) -> &HostCodeMap {
        &self.host_code
    }

    #[inline]
    fn linking_enabled(&self) -> bool {
        USE_BLOCK_LINKING && self.block_linking
    }

    #[inline]
    fn uses_recompiler(&self) -> bool {
        self.mode == CpuExecutionMode::Recompiler
    }

    /// Run until `cpu.pending_ticks` reaches `cpu.downcount`
    pub fn execute(&mut self, cpu: &mut Cpu, bus: &mut Bus) {
        if self.mode == CpuExecutionMode::Interpreter {
            while cpu.pending_ticks < cpu.downcount {
                cpu.step(bus);
            }
            return;
        }

        while cpu.pending_ticks < cpu.downcount {
            if cpu.has_pending_interrupt() {
                cpu.dispatch_interrupt();
            }

            if let Some(fastmem) = &self.fastmem {
                fastmem.state().set_cache_isolated(cpu.is_cache_isolated());
            }
            self.drain_dirty_pages();

            let key = CodeBlockKey::for_cpu(cpu);
            let Some(mut id) = self.lookup_or_compile(bus, key) else {
                tracing::warn!("Falling back to uncached interpreter at 0x{:08x}", cpu.pc());
                self.stats.uncached_fallbacks += 1;
                self.interpret_uncached_block(cpu, bus);
                continue;
            };

            loop {
                self.run_block(cpu, bus, id);
                self.drain_dirty_pages();

                if cpu.pending_ticks >= cpu.downcount
                    || cpu.has_pending_interrupt()
                    || !self.linking_enabled()
                {
                    break;
                }

                match self.next_block(bus, id, CodeBlockKey::for_cpu(cpu)) {
                    Some(next) => id = next,
                    None => break,
                }
            }
        }
    }

    /// Find the block following `id` at `next_key`, preferring recorded
    /// successors and linking a freshly looked up one.
    fn next_block(&mut self, bus: &Bus, id: BlockId, next_key: CodeBlockKey) -> Option<BlockId> {
        let block = self.block(id)?;

        if block.key == next_key {
            // Loops back to itself; make sure it didn't just rewrite itself
            if !block.invalidated || self.revalidate(bus, id) {
                return Some(id);
            }
            return None;
        }
        if block.invalidated {
            return None;
        }

        let linked = block
            .link_successors
            .iter()
            .copied()
            .find(|&s| self.block(s).is_some_and(|b| b.key == next_key));
        if let Some(successor) = linked {
            let valid = self.block(successor).is_some_and(|b| !b.invalidated);
            if valid || self.revalidate(bus, successor) {
                return Some(successor);
            }
        }

        let generation = self.generation;
        let next = self.lookup_or_compile(bus, next_key)?;
        if generation == self.generation && self.block(id).is_some() && linked.is_none() {
            self.link_blocks(id, next);
        }
        Some(next)
    }

    fn run_block(&mut self, cpu: &mut Cpu, bus: &mut Bus, id: BlockId) {
        let Some(block) = self.blocks.get(id.0).and_then(Option::as_ref) else {
            return;
        };
        self.stats.blocks_executed += 1;
        tracing::trace!(
            "Executing block 0x{:08x} ({} instructions)",
            block.pc(),
            block.len()
        );

        match (block.host_code, self.backend.as_mut()) {
            (Some(code), Some(backend)) => backend.execute(code, cpu, bus),
            _ => {
                for inst in &block.instructions {
                    debug_assert_eq!(cpu.regs.pc, inst.pc);
                    cpu.execute_decoded(bus, &inst.decoded);
                    if cpu.exception_raised() {
                        break;
                    }
                }
            }
        }
    }

    /// Step the interpreter through one block's worth of instructions
    /// without caching anything
    fn interpret_uncached_block(&mut self, cpu: &mut Cpu, bus: &mut Bus) {
        loop {
            let in_delay_slot = cpu.in_branch_delay_slot();
            cpu.execute_instruction(bus);
            if cpu.exception_raised() {
                break;
            }

            let decoded = CpuDecoder::decode(cpu.current_instruction.0);
            if (in_delay_slot && !decoded.is_branch()) || decoded.is_exit_block() {
                break;
            }
        }
    }

    /// Valid block for `key`, revalidating or compiling as needed. `None`
    /// means nothing could be compiled at `key`.
    pub fn lookup_or_compile(&mut self, bus: &Bus, key: CodeBlockKey) -> Option<BlockId> {
        if let Some(id) = self.lookup(key) {
            let invalidated = self.block(id).is_some_and(|b| b.invalidated);
            if !invalidated || self.revalidate(bus, id) {
                return Some(id);
            }
        }

        let block = self.compile_block(bus, key);
        if block.is_none() {
            tracing::error!("Failed to compile block at 0x{:08x}", key.pc);
        }
        block
    }

    fn compile_block(&mut self, bus: &Bus, key: CodeBlockKey) -> Option<BlockId> {
        let instructions = decode_block(bus, key);
        if instructions.is_empty() {
            tracing::warn!("Empty block compiled at 0x{:08x}", key.pc);
            return None;
        }

        let mut block = CodeBlock::new(key, instructions);
        let mut backpatches = Vec::new();
        if self.uses_recompiler() {
            let compiled = self.compile_host_code(&block).ok()?;
            block.host_code = Some(compiled.code);
            backpatches = compiled.backpatches;
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            for inst in &block.instructions {
                tracing::trace!(
                    "[{} {} 0x{:08x}] {:08x} {}",
                    if inst.is_branch_delay_slot() { "BD" } else { "  " },
                    if inst.flags.contains(InstructionFlags::LOAD_DELAY_SLOT) {
                        "LD"
                    } else {
                        "  "
                    },
                    inst.pc,
                    inst.word(),
                    inst.decoded.disassemble(inst.pc)
                );
            }
        }

        let id = self.allocate(block);
        self.block_map.insert(key, id);
        self.add_to_page_map(id);
        self.add_to_host_code_map(id, backpatches);
        self.stats.blocks_compiled += 1;
        Some(id)
    }

    /// Flush everything if a block of `instructions` might not fit
    fn ensure_code_space(&mut self, instructions: usize) -> bool {
        let Some(buffer) = &self.code_buffer else {
            return false;
        };
        let (near, far) = worst_case_code_size(instructions);
        if buffer.near_free_space() < near || buffer.far_free_space() < far {
            tracing::warn!("Out of code space, flushing all blocks");
            self.flush();
            return true;
        }
        false
    }

    /// Generate host code, flushing and retrying once if the buffer runs out
    fn compile_host_code(&mut self, block: &CodeBlock) -> Result<CompiledBlock, CpuError> {
        self.ensure_code_space(block.len());

        let mut retried = false;
        loop {
            let (Some(backend), Some(buffer)) = (self.backend.as_mut(), self.code_buffer.as_mut())
            else {
                return Err(CpuError::CompileFailed {
                    pc: block.pc(),
                    reason: "no recompiler backend".into(),
                });
            };

            match backend.compile(block, buffer) {
                Ok(compiled) => return Ok(compiled),
                Err(CpuError::OutOfCodeSpace) if !retried => {
                    tracing::warn!("Out of code space, flushing all blocks");
                    self.flush();
                    retried = true;
                }
                Err(e) => {
                    tracing::error!("Failed to compile host code for block at 0x{:08x}: {}", block.pc(), e);
                    return Err(e);
                }
            }
        }
    }

    /// Check an invalidated block against memory.
    ///
    /// Unchanged code just becomes valid again. Changed code is decoded and
    /// compiled again in place. Returns false if the block had to be
    /// flushed instead, in which case `id` is no longer valid.
    pub fn revalidate(&mut self, bus: &Bus, id: BlockId) -> bool {
        if self.block(id).is_none() {
            return false;
        }
        self.stats.revalidations += 1;

        let Some(block) = self.block(id) else {
            return false;
        };

        if block.matches_memory(bus) {
            if let Some(block) = self.block_mut(id) {
                block.invalidated = false;
            }
            self.add_to_page_map(id);
            return true;
        }

        let key = block.key;
        tracing::debug!("Block 0x{:08x} changed, recompiling", key.pc);
        self.stats.recompilations += 1;
        self.remove_from_host_code_map(id);

        let instructions = decode_block(bus, key);
        if instructions.is_empty() {
            tracing::warn!("Failed to recompile block 0x{:08x}, flushing", key.pc);
            self.flush_block(id);
            return false;
        }

        let mut replacement = CodeBlock::new(key, instructions);
        let mut backpatches = Vec::new();
        if self.uses_recompiler() {
            let generation = self.generation;
            let compiled = self.compile_host_code(&replacement);
            if generation != self.generation {
                // The flush took this block with it
                return false;
            }
            match compiled {
                Ok(compiled) => {
                    replacement.host_code = Some(compiled.code);
                    backpatches = compiled.backpatches;
                }
                Err(_) => {
                    tracing::warn!("Failed to recompile block 0x{:08x}, flushing", key.pc);
                    self.flush_block(id);
                    return false;
                }
            }
        }

        if let Some(block) = self.block_mut(id) {
            block.instructions = replacement.instructions;
            block.host_code = replacement.host_code;
            block.invalidated = false;
        }
        self.add_to_host_code_map(id, backpatches);
        self.add_to_page_map(id);
        true
    }

    /// Mark every block on `page` invalid and drop the page's code flag.
    /// Invalidated blocks leave the index of every page they cover.
    pub fn invalidate_page(&mut self, page: usize) {
        let page = page % RAM_CODE_PAGE_COUNT;
        let ids = std::mem::take(&mut self.ram_block_map[page]);
        for &id in &ids {
            let Some(block) = self.blocks.get_mut(id.0).and_then(Option::as_mut) else {
                continue;
            };
            tracing::debug!("Invalidating block at 0x{:08x}", block.pc());
            block.invalidated = true;
            for other in block.ram_pages() {
                if other != page {
                    self.ram_block_map[other].swap_remove(&id);
                }
            }
        }

        self.ram.clear_code_page(page);
        self.stats.invalidated_pages += 1;
    }

    /// Invalidate pages written since the last drain
    pub fn drain_dirty_pages(&mut self) {
        if !self.ram.has_dirty_pages() {
            return;
        }
        let mut pages = std::mem::take(&mut self.dirty_pages);
        self.ram.take_dirty_pages(&mut pages);
        for page in pages.drain(..) {
            self.invalidate_page(page);
        }
        self.dirty_pages = pages;
    }

    /// Remove one block from every index and free it
    pub fn flush_block(&mut self, id: BlockId) {
        let Some(block) = self.block(id) else {
            return;
        };
        tracing::debug!("Flushing block at 0x{:08x}", block.pc());
        let key = block.key;
        let invalidated = block.invalidated;

        self.unlink_block(id);
        if !invalidated {
            self.remove_from_page_map(id);
        }
        self.remove_from_host_code_map(id);

        if self.block_map.get(&key) == Some(&id) {
            self.block_map.remove(&key);
        }
        self.blocks[id.0] = None;
        self.free_ids.push(id.0);
    }

    /// Discard every block and all native code
    pub fn flush(&mut self) {
        tracing::debug!("Flushing code cache ({} blocks)", self.block_map.len());
        self.ram.clear_code_page_flags();
        for page in self.ram_block_map.iter_mut() {
            page.clear();
        }
        self.blocks.clear();
        self.free_ids.clear();
        self.block_map.clear();
        self.host_code.lock().clear();
        if let Some(buffer) = &mut self.code_buffer {
            buffer.reset();
        }
        self.generation += 1;
        self.stats.flushes += 1;
    }

    fn allocate(&mut self, block: CodeBlock) -> BlockId {
        match self.free_ids.pop() {
            Some(index) => {
                self.blocks[index] = Some(block);
                BlockId(index)
            }
            None => {
                self.blocks.push(Some(block));
                BlockId(self.blocks.len() - 1)
            }
        }
    }

    fn add_to_page_map(&mut self, id: BlockId) {
        let Some(block) = self.block(id) else {
            return;
        };
        let pages: Vec<usize> = block.ram_pages().collect();
        for page in pages {
            self.ram_block_map[page].insert(id);
            self.ram.set_code_page(page);
        }
    }

    fn remove_from_page_map(&mut self, id: BlockId) {
        let Some(block) = self.block(id) else {
            return;
        };
        let pages: Vec<usize> = block.ram_pages().collect();
        for page in pages {
            self.ram_block_map[page].swap_remove(&id);
        }
    }

    fn add_to_host_code_map(&mut self, id: BlockId, backpatches: Vec<BackpatchInfo>) {
        let Some(HostCode { entry, size }) = self.block(id).and_then(|b| b.host_code) else {
            return;
        };
        let previous = self.host_code.lock().insert(
            entry,
            HostCodeEntry {
                block: id,
                size,
                backpatches,
            },
        );
        debug_assert!(previous.is_none(), "host code entry 0x{:x} reused", entry);
    }

    fn remove_from_host_code_map(&mut self, id: BlockId) {
        let Some(code) = self.block_mut(id).and_then(|b| b.host_code.take()) else {
            return;
        };
        self.host_code.lock().remove(&code.entry);
    }

    fn link_blocks(&mut self, from: BlockId, to: BlockId) {
        let (Some(from_block), Some(to_block)) = (self.block(from), self.block(to)) else {
            return;
        };
        tracing::trace!(
            "Linking block 0x{:08x} to 0x{:08x}",
            from_block.pc(),
            to_block.pc()
        );

        if let Some(block) = self.block_mut(from) {
            block.link_successors.push(to);
        }
        if let Some(block) = self.block_mut(to) {
            block.link_predecessors.push(from);
        }
        self.stats.links_made += 1;
    }

    fn unlink_block(&mut self, id: BlockId) {
        let Some(block) = self.block_mut(id) else {
            return;
        };
        let predecessors = std::mem::take(&mut block.link_predecessors);
        let successors = std::mem::take(&mut block.link_successors);

        for pred in predecessors {
            if let Some(block) = self.block_mut(pred) {
                block.link_successors.retain(|&s| s != id);
            }
        }
        for succ in successors {
            if let Some(block) = self.block_mut(succ) {
                block.link_predecessors.retain(|&p| p != id);
            }
        }
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if self.fastmem.is_some() {
            self.ram.set_write_protection(false);
        }
    }
}
