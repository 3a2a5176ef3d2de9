//! Codec benchmark suite.
//!
//! Benchmarks both wire layers at different payload sizes:
//! - Application packets: text events, binary events, decoding
//! - Session framing: text and binary batch payloads
//!
//! Run with: cargo bench --bench codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;

use sockio::protocol::{
    Data, Decoder, Encoder, Packet, Payload, SessionPacket, decode_payload, decode_string,
    encode_payload,
};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[16, 1024, 64 * 1024];
const BATCH_SIZES: &[usize] = &[1, 16, 128];

fn text_event(size: usize) -> Packet {
    let body = "x".repeat(size);
    Packet::event(
        "/chat",
        vec![Payload::from("message"), Payload::from(json!({ "body": body, "n": 1 }))],
        None,
    )
}

fn binary_event(size: usize) -> Packet {
    Packet::event(
        "/files",
        vec![Payload::from("upload"), Payload::binary(vec![7u8; size])],
        None,
    )
}

// ============================================================================
// Benchmark: Application Packets
// ============================================================================

fn bench_packet_encode(c: &mut Criterion) {
    let encoder = Encoder::new();
    let mut group = c.benchmark_group("packet_encode");

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        let packet = text_event(size);
        group.bench_with_input(BenchmarkId::new("text", size), &packet, |b, packet| {
            b.iter(|| encoder.encode(black_box(packet)));
        });

        let packet = binary_event(size);
        group.bench_with_input(BenchmarkId::new("binary", size), &packet, |b, packet| {
            b.iter(|| encoder.encode(black_box(packet)));
        });
    }

    group.finish();
}

fn bench_packet_decode(c: &mut Criterion) {
    let encoder = Encoder::new();
    let mut group = c.benchmark_group("packet_decode");

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        let frames = encoder.encode(&text_event(size));
        let header = frames[0].as_text().unwrap_or_default().to_string();
        group.bench_with_input(BenchmarkId::new("text", size), &header, |b, header| {
            b.iter(|| decode_string(black_box(header)));
        });

        let frames = encoder.encode(&binary_event(size));
        group.bench_with_input(BenchmarkId::new("binary", size), &frames, |b, frames| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                let mut packet = None;
                for frame in frames.iter().cloned() {
                    packet = decoder.add(frame).ok().flatten();
                }
                packet
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Session Batches
// ============================================================================

fn bench_session_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_payload");

    for &count in BATCH_SIZES {
        let packets: Vec<SessionPacket> = (0..count)
            .map(|n| SessionPacket::message(format!(r#"2["tick",{n}]"#)))
            .collect();

        group.bench_with_input(BenchmarkId::new("encode_text", count), &packets, |b, packets| {
            b.iter(|| encode_payload(black_box(packets), false));
        });

        let encoded = encode_payload(&packets, false);
        group.bench_with_input(BenchmarkId::new("decode_text", count), &encoded, |b, data| {
            b.iter(|| decode_payload(black_box(data)));
        });

        let binary: Vec<SessionPacket> = (0..count)
            .map(|_| SessionPacket::message(Data::Binary(vec![1u8; 256])))
            .collect();
        let encoded = encode_payload(&binary, true);
        group.bench_with_input(BenchmarkId::new("decode_binary", count), &encoded, |b, data| {
            b.iter(|| decode_payload(black_box(data)));
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_packet_encode, bench_packet_decode, bench_session_payload);
criterion_main!(benches);
