//! Code cache behavior against the plain interpreter

use px_core::config::{CpuConfig, CpuExecutionMode};
use px_cpu::{CodeBlockKey, CodeCache, Cpu};
use px_memory::Bus;

/// Sums 10..1 into $t2, storing each partial sum from 0x80010200, then
/// reloads the last one into $t3 and spins.
const SUM_PROGRAM: &[u32] = &[
    0x3C08_8001, // lui $t0, 0x8001
    0x3508_0200, // ori $t0, $t0, 0x200
    0x2409_000A, // addiu $t1, $zero, 10
    0x240A_0000, // addiu $t2, $zero, 0
    0x0149_5021, // loop: addu $t2, $t2, $t1
    0xAD0A_0000, // sw $t2, 0($t0)
    0x2508_0004, // addiu $t0, $t0, 4
    0x2529_FFFF, // addiu $t1, $t1, -1
    0x1520_FFFB, // bne $t1, $zero, loop
    0x0000_0000, // nop
    0x8D0B_FFFC, // lw $t3, -4($t0)
    0x1000_FFFF, // spin: beq $zero, $zero, spin
    0x0000_0000, // nop
];

fn config(mode: CpuExecutionMode) -> CpuConfig {
    CpuConfig {
        execution_mode: mode,
        fastmem: false,
        block_linking: true,
    }
}

fn load(bus: &mut Bus, addr: u32, program: &[u32]) {
    for (n, word) in program.iter().enumerate() {
        bus.write_u32(addr + n as u32 * 4, *word).unwrap();
    }
}

fn run(cache: &mut CodeCache, cpu: &mut Cpu, bus: &mut Bus, ticks: u64) {
    cpu.downcount = cpu.pending_ticks + ticks;
    cache.execute(cpu, bus);
}

fn run_program(mode: CpuExecutionMode, program: &[u32]) -> (Cpu, Bus, CodeCache) {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8001_0000, program);
    let mut cpu = Cpu::new(bus.interrupts().clone());
    cpu.set_pc(0x8001_0000);
    let mut cache = CodeCache::new(&config(mode), &bus, None);
    run(&mut cache, &mut cpu, &mut bus, 500);
    (cpu, bus, cache)
}

#[test]
fn test_cached_matches_interpreter() {
    let (interp, interp_bus, _) = run_program(CpuExecutionMode::Interpreter, SUM_PROGRAM);
    let (cached, cached_bus, cache) = run_program(CpuExecutionMode::CachedInterpreter, SUM_PROGRAM);

    assert_eq!(interp.read_reg(10), 55);
    assert_eq!(interp.read_reg(11), 55);
    assert_eq!(interp.regs.gpr, cached.regs.gpr);
    assert_eq!(interp.regs.hi, cached.regs.hi);
    assert_eq!(interp.regs.lo, cached.regs.lo);
    for n in 0..10 {
        let addr = 0x8001_0200 + n * 4;
        assert_eq!(interp_bus.read_u32(addr).unwrap(), cached_bus.read_u32(addr).unwrap());
    }
    assert!(cache.stats().blocks_compiled >= 3);
    assert!(cache.stats().links_made > 0);
}

#[test]
fn test_cached_without_linking_matches() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8001_0000, SUM_PROGRAM);
    let mut cpu = Cpu::new(bus.interrupts().clone());
    cpu.set_pc(0x8001_0000);
    let mut config = config(CpuExecutionMode::CachedInterpreter);
    config.block_linking = false;
    let mut cache = CodeCache::new(&config, &bus, None);
    run(&mut cache, &mut cpu, &mut bus, 500);

    assert_eq!(cpu.read_reg(10), 55);
    assert_eq!(cpu.read_reg(11), 55);
    assert_eq!(cache.stats().links_made, 0);
}

#[test]
fn test_bus_write_invalidates_and_recompiles() {
    let mut bus = Bus::new(&[]).unwrap();
    load(
        &mut bus,
        0x8003_0000,
        &[
            0x2442_0001, // addiu $v0, $v0, 1
            0x0800_C004, // j 0x80030010
            0x0000_0000,
            0x0000_0000,
            0x1000_FFFF, // spin
            0x0000_0000,
        ],
    );
    let mut cpu = Cpu::new(bus.interrupts().clone());
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);

    cpu.set_pc(0x8003_0000);
    run(&mut cache, &mut cpu, &mut bus, 50);
    assert_eq!(cpu.read_reg(2), 1);

    // addiu $v0, $v0, 5
    bus.write_u32(0x8003_0000, 0x2442_0005).unwrap();
    cpu.set_pc(0x8003_0000);
    run(&mut cache, &mut cpu, &mut bus, 50);
    assert_eq!(cpu.read_reg(2), 6);
    assert_eq!(cache.stats().recompilations, 1);
}

#[test]
fn test_unchanged_write_revalidates_without_recompiling() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8003_0000, &[0x2442_0001, 0x0000_000C]);
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);
    let key = CodeBlockKey::new(0x8003_0000, false);
    let id = cache.lookup_or_compile(&bus, key).unwrap();

    // Same word again, and a data write elsewhere in the page
    bus.write_u32(0x8003_0000, 0x2442_0001).unwrap();
    bus.write_u32(0x8003_0800, 0x1234_5678).unwrap();
    cache.drain_dirty_pages();
    assert!(cache.block(id).unwrap().invalidated);
    assert_eq!(cache.blocks_in_page(0x30).count(), 0);

    assert_eq!(cache.lookup_or_compile(&bus, key), Some(id));
    assert!(!cache.block(id).unwrap().invalidated);
    assert_eq!(cache.blocks_in_page(0x30).collect::<Vec<_>>(), vec![id]);
    assert_eq!(cache.stats().revalidations, 1);
    assert_eq!(cache.stats().recompilations, 0);
}

#[test]
fn test_single_word_change_never_stays_valid() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8003_0000, &[0x2442_0001, 0x2442_0002, 0x0000_000C]);
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);
    let key = CodeBlockKey::new(0x8003_0000, false);
    let id = cache.lookup_or_compile(&bus, key).unwrap();

    bus.write_u32(0x8003_0004, 0x2442_0003).unwrap();
    cache.drain_dirty_pages();
    assert!(cache.revalidate(&bus, id));

    let block = cache.block(id).unwrap();
    assert!(!block.invalidated);
    assert_eq!(block.instructions[1].word(), 0x2442_0003);
    assert!(block.matches_memory(&bus));
}

#[test]
fn test_guest_store_to_own_code() {
    let mut bus = Bus::new(&[]).unwrap();
    load(
        &mut bus,
        0x8004_0000,
        &[
            0x0C01_0040, // jal 0x80040100
            0x0000_0000,
            0x3C09_2402, // lui $t1, 0x2402
            0x3529_0007, // ori $t1, $t1, 7
            0x3C08_8004, // lui $t0, 0x8004
            0xAD09_0100, // sw $t1, 0x100($t0)
            0x0C01_0040, // jal 0x80040100
            0x0000_0000,
            0x1000_FFFF, // spin
            0x0000_0000,
        ],
    );
    load(
        &mut bus,
        0x8004_0100,
        &[
            0x2402_0001, // addiu $v0, $zero, 1
            0x03E0_0008, // jr $ra
            0x0000_0000,
        ],
    );

    let mut cpu = Cpu::new(bus.interrupts().clone());
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);
    cpu.set_pc(0x8004_0000);
    run(&mut cache, &mut cpu, &mut bus, 200);

    assert_eq!(cpu.read_reg(2), 7);
    assert!(cache.stats().recompilations >= 1);
}

#[test]
fn test_flush_round_trip() {
    let mut bus = Bus::new(&[]).unwrap();
    load(&mut bus, 0x8001_0000, SUM_PROGRAM);
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);
    let key = CodeBlockKey::new(0x8001_0010, false);

    let id = cache.lookup_or_compile(&bus, key).unwrap();
    let before = cache.block(id).unwrap().instructions.clone();

    cache.flush();
    assert_eq!(cache.block_count(), 0);
    assert!(!bus.is_ram_code_page(0x10));

    let id = cache.lookup_or_compile(&bus, key).unwrap();
    assert_eq!(cache.block(id).unwrap().instructions, before);
    assert!(bus.is_ram_code_page(0x10));
}

#[test]
fn test_uncached_fallback_raises_address_error() {
    let mut bus = Bus::new(&[]).unwrap();
    // Exception vector spins
    load(&mut bus, 0x8000_0080, &[0x1000_FFFF, 0x0000_0000]);
    let mut cpu = Cpu::new(bus.interrupts().clone());
    cpu.cop0.sr = 0;
    let mut cache = CodeCache::new(&config(CpuExecutionMode::CachedInterpreter), &bus, None);

    cpu.set_pc(0x8001_0002);
    run(&mut cache, &mut cpu, &mut bus, 20);

    assert_eq!(cache.stats().uncached_fallbacks, 1);
    assert_eq!(cpu.cop0.bad_vaddr, 0x8001_0002);
    assert_eq!((cpu.cop0.cause >> 2) & 0x1F, 0x04);
}
