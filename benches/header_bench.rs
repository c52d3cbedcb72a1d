use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use network_transport::core::address::{NodeAddress, SockAddr};
use network_transport::core::header::{WireHeader, HEADER_SIZE};
use network_transport::core::ring_buffer::RingBuffer;
use std::net::Ipv4Addr;

fn sample_header(size: u32) -> WireHeader {
    let src = NodeAddress::direct(SockAddr::new(Ipv4Addr::new(10, 0, 0, 1), 5377));
    let dest = NodeAddress::new(
        SockAddr::new(Ipv4Addr::new(10, 0, 0, 2), 5377),
        SockAddr::new(Ipv4Addr::new(192, 0, 2, 1), 6000),
    );
    WireHeader::new(src, dest, 42, 0, size)
}

#[allow(clippy::unwrap_used)]
fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_header");
    group.throughput(Throughput::Bytes(HEADER_SIZE as u64));

    let header = sample_header(1024);
    group.bench_function("encode", |b| b.iter(|| header.encode()));

    let bytes = header.encode();
    group.bench_function("decode", |b| {
        b.iter(|| WireHeader::decode(&bytes).unwrap())
    });
    group.bench_function("peek_size", |b| {
        b.iter(|| WireHeader::peek_size(&bytes).unwrap())
    });

    group.finish();
}

/// Frame reassembly through the read buffer: append a framed message, then
/// take header and body back out.
#[allow(clippy::unwrap_used)]
fn bench_frame_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_reassembly");
    let payload_sizes = [64usize, 512, 4096, 65536];

    for &size in &payload_sizes {
        let mut frame = sample_header(size as u32).encode().to_vec();
        frame.extend(std::iter::repeat(0xab).take(size));

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(format!("take_{size}b"), |b| {
            b.iter_batched(
                || RingBuffer::new(32 * 1024),
                |mut buf| {
                    buf.extend_from_slice(&frame);
                    let head = buf.take(HEADER_SIZE).unwrap();
                    let header = WireHeader::decode(&head).unwrap();
                    buf.take(header.size as usize).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_header, bench_frame_reassembly);
criterion_main!(benches);
