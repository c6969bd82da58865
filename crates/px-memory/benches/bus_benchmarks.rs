//! Benchmarks for bus access patterns

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use px_memory::{constants::*, Bus};

fn bench_ram_read_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("ram_access");

    for size in [1024u32, 16384, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("write", size), size, |b, &size| {
            let mut bus = Bus::new(&vec![0u8; BIOS_SIZE as usize]).unwrap();
            b.iter(|| {
                for addr in (0..size).step_by(4) {
                    bus.write_u32(0x8000_0000 + addr, black_box(0xDEAD_BEEF)).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("read", size), size, |b, &size| {
            let bus = Bus::new(&vec![0u8; BIOS_SIZE as usize]).unwrap();
            b.iter(|| {
                let mut sum = 0u64;
                for addr in (0..size).step_by(4) {
                    sum = sum.wrapping_add(bus.read_u32(0x8000_0000 + addr).unwrap() as u64);
                }
                black_box(sum);
            });
        });
    }

    group.finish();
}

fn bench_code_page_writes(c: &mut Criterion) {
    let mut bus = Bus::new(&vec![0u8; BIOS_SIZE as usize]).unwrap();
    let mut dirty = Vec::new();

    c.bench_function("code_page_write_and_drain", |b| {
        b.iter(|| {
            for page in 0..64 {
                bus.set_ram_code_page(page);
                bus.write_u32(page as u32 * RAM_CODE_PAGE_SIZE, black_box(0)).unwrap();
            }
            dirty.clear();
            bus.ram().take_dirty_pages(&mut dirty);
            black_box(dirty.len());
        });
    });
}

criterion_group!(benches, bench_ram_read_write, bench_code_page_writes);
criterion_main!(benches);
