//! Performance benchmarks for the frame codec.
//!
//! The link runs at 19200 baud, so throughput here is never the bottleneck;
//! these benchmarks exist to catch accidental quadratic behavior in the
//! byte-push assembler.
//!
//! Run with:
//! ```sh
//! cargo bench --bench frame_bench
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ecrlink_core::{Amount, TransactionId};
use ecrlink_protocol::{TransactionRequest, WireAssembler, WireEvent, build_frame};
use std::hint::black_box;

fn request_frame() -> Vec<u8> {
    let request = TransactionRequest::payment(
        Amount::new(1234).unwrap(),
        TransactionId::new("00042").unwrap(),
        false,
    );
    build_frame(&request.encode())
}

fn bench_build_frame(c: &mut Criterion) {
    let request = TransactionRequest::payment(
        Amount::new(1234).unwrap(),
        TransactionId::new("00042").unwrap(),
        false,
    );
    let payload = request.encode();

    let mut group = c.benchmark_group("build_frame");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("transaction_request", |b| {
        b.iter(|| build_frame(black_box(&payload)));
    });
    group.finish();
}

fn bench_assemble(c: &mut Criterion) {
    let frame = request_frame();

    let mut group = c.benchmark_group("assemble");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("byte_by_byte", |b| {
        b.iter(|| {
            let mut assembler = WireAssembler::new();
            let mut frames = 0;
            for &byte in &frame {
                if let Some(WireEvent::Frame(_)) = assembler.push(black_box(byte)) {
                    frames += 1;
                }
            }
            frames
        });
    });
    group.finish();
}

fn bench_multipart(c: &mut Criterion) {
    let mut group = c.benchmark_group("multipart");
    for parts in [2usize, 8, 32] {
        // Split one 1 KiB payload into equal ETB-continued parts.
        let payload = vec![b'x'; 1024];
        let chunk = payload.len() / parts;
        let mut wire = Vec::new();
        for (i, body) in payload.chunks(chunk).enumerate() {
            let mut body = body.to_vec();
            if (i + 1) * chunk < payload.len() {
                body.push(0x17); // ETB
            }
            wire.extend_from_slice(&build_frame(&body));
        }

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(parts), &wire, |b, wire| {
            b.iter(|| {
                let mut assembler = WireAssembler::new();
                wire.iter()
                    .filter_map(|&byte| assembler.push(byte))
                    .filter(|e| matches!(e, WireEvent::Frame(_) | WireEvent::Part))
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_frame, bench_assemble, bench_multipart);
criterion_main!(benches);
