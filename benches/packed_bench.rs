use std::hint::black_box;
use std::io::Cursor;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use segmerge::bkd::{BkdConfig, BkdReader, BkdWriter, PointRangeVisitor};
use segmerge::storage::memory::{MemoryStorage, MemoryStorageConfig};
use segmerge::storage::structured::{StructReader, StructWriter};
use segmerge::storage::{IOContext, Storage};
use segmerge::util::numeric::int_to_sortable_bytes;
use segmerge::util::packed::{
    MonotonicBlockPackedReader, MonotonicBlockPackedWriter, VERSION_CURRENT, get_mutable,
};

fn monotonic_values(count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut value = 0i64;
    (0..count)
        .map(|_| {
            value += rng.random_range(0..64);
            value
        })
        .collect()
}

fn write_monotonic(values: &[i64], block_size: usize) -> Vec<u8> {
    let mut out = StructWriter::new(Vec::new());
    {
        let mut writer = MonotonicBlockPackedWriter::new(&mut out, block_size).unwrap();
        for &v in values {
            writer.add(v).unwrap();
        }
        writer.finish().unwrap();
    }
    out.into_inner()
}

fn bench_mutable(c: &mut Criterion) {
    let mut group = c.benchmark_group("Packed Mutable");
    let count = 1 << 16;
    group.throughput(Throughput::Elements(count as u64));

    for bits in [1u32, 7, 20, 32, 63] {
        let mut packed = get_mutable(count, bits);
        let max = (1u64 << bits) - 1;
        for i in 0..count {
            packed.set(i, (i as u64 * 2_654_435_761) & max);
        }
        group.bench_with_input(BenchmarkId::new("get", bits), &packed, |b, packed| {
            b.iter(|| {
                let mut sum = 0u64;
                for i in 0..count {
                    sum = sum.wrapping_add(packed.get(i));
                }
                black_box(sum)
            })
        });
    }
    group.finish();
}

fn bench_monotonic(c: &mut Criterion) {
    let mut group = c.benchmark_group("Monotonic Block Packed");
    let values = monotonic_values(100_000);
    group.throughput(Throughput::Elements(values.len() as u64));

    for block_size in [64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::new("write", block_size), &block_size, |b, &block_size| {
            b.iter(|| black_box(write_monotonic(&values, block_size)))
        });

        let bytes = write_monotonic(&values, block_size);
        let mut input = StructReader::new(Cursor::new(bytes), "bench");
        let reader = MonotonicBlockPackedReader::open(
            &mut input,
            VERSION_CURRENT,
            block_size,
            values.len() as u64,
        )
        .unwrap();
        group.bench_with_input(BenchmarkId::new("get", block_size), &reader, |b, reader| {
            b.iter(|| {
                let mut sum = 0i64;
                for i in 0..reader.size() {
                    sum = sum.wrapping_add(reader.get(i));
                }
                black_box(sum)
            })
        });
    }
    group.finish();
}

fn build_tree(storage: &MemoryStorage, num_points: u32) -> BkdReader {
    let mut rng = StdRng::seed_from_u64(42);
    let config = BkdConfig::new(2, 2, 4, 512).unwrap();
    let mut writer = BkdWriter::new(config, num_points).unwrap();
    for doc in 0..num_points {
        let packed: Vec<u8> = [rng.random_range(0..1_000_000), rng.random_range(0..1_000_000)]
            .iter()
            .flat_map(|&v: &i32| int_to_sortable_bytes(v))
            .collect();
        writer.add(&packed, doc).unwrap();
    }
    let output = storage.create_output("bench.dim", &IOContext::DEFAULT).unwrap();
    let mut out = StructWriter::new(output);
    let fp = writer.finish(&mut out).unwrap().unwrap();
    out.close().unwrap();

    let input = storage.open_input("bench.dim", &IOContext::READ).unwrap();
    let mut input = StructReader::new(input, "bench.dim");
    input.seek(fp).unwrap();
    BkdReader::open(input).unwrap()
}

fn bench_bkd_intersect(c: &mut Criterion) {
    let mut group = c.benchmark_group("BKD Intersect");
    group.sample_size(20);
    let storage = MemoryStorage::new(MemoryStorageConfig::default());
    let reader = build_tree(&storage, 200_000);

    for (label, width) in [("narrow", 10_000), ("wide", 500_000)] {
        let lower: Vec<u8> = [250_000, 250_000].iter().flat_map(|&v: &i32| int_to_sortable_bytes(v)).collect();
        let upper: Vec<u8> = [250_000 + width, 250_000 + width]
            .iter()
            .flat_map(|&v: &i32| int_to_sortable_bytes(v))
            .collect();
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut visitor = PointRangeVisitor::new(lower.clone(), upper.clone(), 4).unwrap();
                reader.intersect(&mut visitor).unwrap();
                black_box(visitor.docs().len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mutable, bench_monotonic, bench_bkd_intersect);
criterion_main!(benches);
