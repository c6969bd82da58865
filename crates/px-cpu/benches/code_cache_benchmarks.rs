//! Benchmarks comparing the interpreter with the cached interpreter

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use px_core::config::{CpuConfig, CpuExecutionMode};
use px_cpu::{CodeBlockKey, CodeCache, Cpu};
use px_memory::{constants::*, Bus};

/// Tight counting loop followed by a spin
const LOOP_PROGRAM: &[u32] = &[
    0x3C09_0001, // lui $t1, 1
    0x2442_0003, // loop: addiu $v0, $v0, 3
    0x0040_1821, // addu $v1, $v0, $zero
    0x2529_FFFF, // addiu $t1, $t1, -1
    0x1520_FFFC, // bne $t1, $zero, loop
    0x0000_0000, // nop
    0x1000_FFFF, // spin
    0x0000_0000,
];

fn setup() -> Bus {
    let mut bus = Bus::new(&vec![0u8; BIOS_SIZE as usize]).unwrap();
    for (n, word) in LOOP_PROGRAM.iter().enumerate() {
        bus.write_u32(0x8001_0000 + n as u32 * 4, *word).unwrap();
    }
    bus
}

fn bench_execution_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    for mode in [CpuExecutionMode::Interpreter, CpuExecutionMode::CachedInterpreter] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", mode)), &mode, |b, &mode| {
            let mut bus = setup();
            let config = CpuConfig {
                execution_mode: mode,
                ..CpuConfig::default()
            };
            let mut cache = CodeCache::new(&config, &bus, None);
            let mut cpu = Cpu::new(bus.interrupts().clone());

            b.iter(|| {
                cpu.set_pc(0x8001_0000);
                cpu.downcount = cpu.pending_ticks + 100_000;
                cache.execute(&mut cpu, &mut bus);
                black_box(cpu.read_reg(3));
            });
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let bus = setup();
    let config = CpuConfig::default();
    let mut cache = CodeCache::new(&config, &bus, None);
    let key = CodeBlockKey::new(0x8001_0000, false);

    c.bench_function("compile_block", |b| {
        b.iter(|| {
            cache.flush();
            black_box(cache.lookup_or_compile(&bus, key));
        });
    });
}

fn bench_invalidate_revalidate(c: &mut Criterion) {
    let mut bus = setup();
    let config = CpuConfig::default();
    let mut cache = CodeCache::new(&config, &bus, None);
    let key = CodeBlockKey::new(0x8001_0004, false);
    cache.lookup_or_compile(&bus, key);

    c.bench_function("invalidate_revalidate", |b| {
        b.iter(|| {
            bus.write_u32(0x8001_0800, black_box(0)).unwrap();
            cache.drain_dirty_pages();
            black_box(cache.lookup_or_compile(&bus, key));
        });
    });
}

criterion_group!(benches, bench_execution_modes, bench_compile, bench_invalidate_revalidate);
criterion_main!(benches);
