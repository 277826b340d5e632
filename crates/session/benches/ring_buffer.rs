//! Benchmarks for the session ring buffer
//!
//! Measures the two paths the reader and foreground reads exercise:
//! - Packet-sized writes followed by a drain
//! - Steady-state write/read cycles that wrap around the storage
//! - Writes into a full buffer under each overflow policy

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use usb_session::{OverflowPolicy, RingBuffer};

fn benchmark_fill_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_and_drain");

    for packet in [8usize, 64, 512].iter() {
        let rb = RingBuffer::new(4096, OverflowPolicy::DropNewest).unwrap();
        let data = vec![0xA5u8; *packet];

        group.throughput(Throughput::Bytes(4096));
        group.bench_with_input(BenchmarkId::from_parameter(packet), packet, |b, _| {
            b.iter(|| {
                while rb.write(black_box(&data)) == data.len() {}
                rb.read(black_box(4096))
            })
        });
    }

    group.finish();
}

fn benchmark_wrapping_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("wrapping_cycle");

    // 64-byte packets into a 1000-byte ring never align with the end
    let rb = RingBuffer::new(1000, OverflowPolicy::DropNewest).unwrap();
    let packet = [0x5Au8; 64];
    let mut out = [0u8; 64];

    group.throughput(Throughput::Bytes(64));
    group.bench_function("write_read_64", |b| {
        b.iter(|| {
            rb.write(black_box(&packet));
            rb.read_into(black_box(&mut out))
        })
    });

    group.finish();
}

fn benchmark_overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("overflow");
    let packet = [0x11u8; 64];

    for policy in [OverflowPolicy::DropNewest, OverflowPolicy::OverwriteOldest] {
        let rb = RingBuffer::new(256, policy).unwrap();
        while rb.len() < rb.capacity() {
            rb.write(&packet);
        }

        group.throughput(Throughput::Bytes(64));
        group.bench_function(format!("{:?}", policy), |b| {
            b.iter(|| rb.write(black_box(&packet)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fill_and_drain,
    benchmark_wrapping_cycle,
    benchmark_overflow
);

criterion_main!(benches);
