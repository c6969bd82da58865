//! Code cache driving a recompiler backend
//!
//! The backend here emits filler bytes and replays the decoded instructions
//! through the interpreter, which is enough to exercise code buffer
//! management, host code bookkeeping and out-of-space recovery.

use parking_lot::Mutex;
use px_core::config::{CpuConfig, CpuExecutionMode};
use px_core::error::CpuError;
use px_cpu::{
    BackpatchInfo, Backpatcher, CodeBlock, CodeBlockKey, CodeBuffer, CodeCache, CompiledBlock,
    Cpu, DecodedInstruction, HostCode, RecompilerBackend,
};
use px_memory::{ram_code_page_index, Bus, PageState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Shared {
    programs: Mutex<HashMap<usize, Vec<DecodedInstruction>>>,
    compiles: AtomicUsize,
    /// Number of upcoming compiles that report a full buffer
    fail_next: AtomicUsize,
}

struct NoBackpatch;

impl Backpatcher for NoBackpatch {
    fn backpatch(&self, _info: &BackpatchInfo) -> bool {
        false
    }
}

struct ReplayBackend {
    shared: Arc<Shared>,
}

impl RecompilerBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    fn compile(&mut self, block: &CodeBlock, buffer: &mut CodeBuffer) -> Result<CompiledBlock, CpuError> {
        self.shared.compiles.fetch_add(1, Ordering::SeqCst);
        let pending = self.shared.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.shared.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(CpuError::OutOfCodeSpace);
        }

        let size = block.len() * 4;
        let entry = buffer.emit_near(&vec![0xCC; size])?;
        let decoded = block.instructions.iter().map(|i| i.decoded).collect();
        self.shared.programs.lock().insert(entry, decoded);

        Ok(CompiledBlock {
            code: HostCode { entry, size },
            backpatches: vec![BackpatchInfo {
                host_pc: entry,
                host_code_size: size,
                guest_pc: block.pc(),
                data: 0,
            }],
        })
    }

    fn execute(&mut self, code: HostCode, cpu: &mut Cpu, bus: &mut Bus) {
        let program = self.shared.programs.lock().get(&code.entry).cloned().unwrap();
        for decoded in &program {
            cpu.execute_decoded(bus, decoded);
            if cpu.exception_raised() {
                break;
            }
        }
    }

    fn backpatcher(&self) -> Arc<dyn Backpatcher> {
        Arc::new(NoBackpatch)
    }
}

fn recompiler_cache(bus: &Bus) -> (CodeCache, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let config = CpuConfig {
        execution_mode: CpuExecutionMode::Recompiler,
        fastmem: false,
        block_linking: true,
    };
    let backend = ReplayBackend {
        shared: Arc::clone(&shared),
    };
    (CodeCache::new(&config, bus, Some(Box::new(backend))), shared)
}

fn load(bus: &mut Bus, addr: u32, program: &[u32]) {
    for (n, word) in program.iter().enumerate() {
        bus.write_u32(addr + n as u32 * 4, *word).unwrap();
    }
}

const COUNT_PROGRAM: &[u32] = &[
    0x2409_0020, // addiu $t1, $zero, 32
    0x2442_0003, // loop: addiu $v0, $v0, 3
    0x2529_FFFF, // addiu $t1, $t1, -1
    0x1520_FFFD, // bne $t1, $zero, loop
    0x0000_0000, // nop
    0x1000_FFFF, // spin
    0x0000_0000,
];

#[test]
fn test_recompiler_mode_runs_host_code() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let (mut cache, shared) = recompiler_cache(&bus);
    assert_eq!(cache.mode(), CpuExecutionMode::Recompiler);

    let mut cpu = Cpu::new(bus.interrupts().clone());
    cpu.set_pc(0x8002_0000);
    cpu.downcount = 1000;
    cache.execute(&mut cpu, &mut bus);

    assert_eq!(cpu.read_reg(2), 96);
    assert_eq!(cpu.read_reg(9), 0);
    assert_eq!(shared.compiles.load(Ordering::SeqCst), 3);
    assert_eq!(cache.host_code_map().lock().len(), 3);
}

#[test]
fn test_host_code_map_tracks_blocks() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let (mut cache, _shared) = recompiler_cache(&bus);

    let id = cache
        .lookup_or_compile(&bus, CodeBlockKey::new(0x8002_0004, false))
        .unwrap();
    let code = cache.block(id).unwrap().host_code.unwrap();
    {
        let map = cache.host_code_map().lock();
        let entry = map.get(&code.entry).unwrap();
        assert_eq!(entry.block, id);
        assert_eq!(entry.size, code.size);
        assert_eq!(entry.backpatches.len(), 1);
    }

    cache.flush_block(id);
    assert!(cache.host_code_map().lock().is_empty());
    assert!(cache.lookup(CodeBlockKey::new(0x8002_0004, false)).is_none());
}

#[test]
fn test_out_of_space_flushes_and_retries() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let (mut cache, shared) = recompiler_cache(&bus);

    let first = CodeBlockKey::new(0x8002_0000, false);
    let second = CodeBlockKey::new(0x8002_0014, false);
    cache.lookup_or_compile(&bus, first).unwrap();

    shared.fail_next.store(1, Ordering::SeqCst);
    let id = cache.lookup_or_compile(&bus, second).unwrap();

    assert_eq!(cache.stats().flushes, 1);
    assert_eq!(cache.block_count(), 1);
    assert!(cache.lookup(first).is_none());
    assert_eq!(cache.lookup(second), Some(id));
    assert!(cache.block(id).unwrap().host_code.is_some());
}

#[test]
fn test_repeated_out_of_space_gives_up() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let (mut cache, shared) = recompiler_cache(&bus);

    shared.fail_next.store(2, Ordering::SeqCst);
    assert!(cache
        .lookup_or_compile(&bus, CodeBlockKey::new(0x8002_0000, false))
        .is_none());
    assert_eq!(cache.block_count(), 0);

    // The next attempt has room again
    assert!(cache
        .lookup_or_compile(&bus, CodeBlockKey::new(0x8002_0000, false))
        .is_some());
}

#[test]
fn test_recompile_after_code_change() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let (mut cache, shared) = recompiler_cache(&bus);
    let key = CodeBlockKey::new(0x8002_0004, false);

    let id = cache.lookup_or_compile(&bus, key).unwrap();
    let old = cache.block(id).unwrap().host_code.unwrap();

    // addiu $v0, $v0, 5
    bus.write_u32(0x8002_0004, 0x2442_0005).unwrap();
    cache.drain_dirty_pages();
    assert_eq!(cache.lookup_or_compile(&bus, key), Some(id));

    let new = cache.block(id).unwrap().host_code.unwrap();
    assert_ne!(old.entry, new.entry);
    assert_eq!(shared.compiles.load(Ordering::SeqCst), 2);
    let map = cache.host_code_map().lock();
    assert!(!map.contains_key(&old.entry));
    assert_eq!(map.get(&new.entry).map(|e| e.block), Some(id));
}

#[test]
fn test_host_store_to_protected_code_page_recompiles() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8002_0000, COUNT_PROGRAM);
    let shared = Arc::new(Shared::default());
    let config = CpuConfig {
        execution_mode: CpuExecutionMode::Recompiler,
        fastmem: true,
        block_linking: true,
    };
    let backend = ReplayBackend {
        shared: Arc::clone(&shared),
    };
    let mut cache = CodeCache::new(&config, &bus, Some(Box::new(backend)));
    if !cache.is_fastmem_active() {
        // Host pages are not 4 KiB
        return;
    }

    let mut cpu = Cpu::new(bus.interrupts().clone());
    cpu.set_pc(0x8002_0000);
    cpu.downcount = 1000;
    cache.execute(&mut cpu, &mut bus);
    assert_eq!(cpu.read_reg(2), 96);

    let page = ram_code_page_index(0x2_0000);
    assert!(bus.ram().page_state(page).contains(PageState::PROTECTED));
    let compiled = shared.compiles.load(Ordering::SeqCst);

    // A raw host store faults, the handler unprotects the page and the
    // store completes: addiu $v0, $v0, 5
    unsafe {
        std::ptr::write_volatile(bus.ram().base_ptr().add(0x2_0004) as *mut u32, 0x2442_0005);
    }
    assert_eq!(bus.read_u32(0x8002_0004).unwrap(), 0x2442_0005);
    let state = bus.ram().page_state(page);
    assert!(state.contains(PageState::DIRTY));
    assert!(!state.contains(PageState::PROTECTED));

    cpu.write_reg(2, 0);
    cpu.set_pc(0x8002_0000);
    cpu.downcount = cpu.pending_ticks + 1000;
    cache.execute(&mut cpu, &mut bus);

    assert_eq!(cpu.read_reg(2), 160);
    assert!(cache.stats().invalidated_pages >= 1);
    assert!(shared.compiles.load(Ordering::SeqCst) > compiled);
    assert!(bus.ram().page_state(page).contains(PageState::PROTECTED));
}

#[test]
fn test_missing_backend_downgrades() {
    let bus = Bus::new(&[]).unwrap();
    let config = CpuConfig {
        execution_mode: CpuExecutionMode::Recompiler,
        fastmem: true,
        block_linking: true,
    };
    let cache = CodeCache::new(&config, &bus, None);
    assert_eq!(cache.mode(), CpuExecutionMode::CachedInterpreter);
    assert!(!cache.is_fastmem_active());
}
