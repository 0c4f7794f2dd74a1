// ABOUTME: Benchmark suite for the gateway's framing hot paths
// ABOUTME: Measures binary frame encode/decode and WebSocket frame handling

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use shield::codec;
use shield::protocol::ws::{self, WsFrame};
use std::time::Duration;

fn bench_binary_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_framing");

    for size in [16usize, 1024, 64 * 1024] {
        let payload = vec![0x42u8; size];
        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| codec::encode(black_box(payload)));
        });

        let frame = codec::encode(&payload);
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| codec::decode(black_box(frame)).unwrap().unwrap());
        });
    }

    // A stream of small frames drained the way the gateway does it.
    let mut stream = Vec::new();
    for i in 0..100u8 {
        stream.extend_from_slice(&codec::encode(&[i; 32]));
    }
    group.bench_function("drain_100_frames", |b| {
        b.iter(|| {
            let mut offset = 0;
            let mut count = 0;
            while let Some((payload, consumed)) = codec::decode(&stream[offset..]).unwrap() {
                black_box(payload);
                offset += consumed;
                count += 1;
            }
            assert_eq!(count, 100);
        });
    });

    group.finish();
}

fn bench_websocket_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("websocket_frames");

    for size in [16usize, 1024, 64 * 1024] {
        let unmasked = WsFrame::text(vec![0x42u8; size]);
        group.bench_with_input(
            BenchmarkId::new("encode_unmasked", size),
            &unmasked,
            |b, frame| {
                b.iter(|| ws::encode_frame(black_box(frame)));
            },
        );

        let masked = WsFrame::text(vec![0x42u8; size]).masked_with([0xDE, 0xAD, 0xBE, 0xEF]);
        let wire = ws::encode_frame(&masked);
        group.bench_with_input(BenchmarkId::new("parse_masked", size), &wire, |b, wire| {
            b.iter(|| ws::parse_frame(black_box(wire)).unwrap().unwrap());
        });
    }

    group.finish();
}

fn bench_websocket_handshake(c: &mut Criterion) {
    let request: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    c.bench_function("websocket_handshake", |b| {
        b.iter(|| ws::handshake_response(black_box(request)).unwrap());
    });
}

fn configured() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100)
}

criterion_group! {
    name = benches;
    config = configured();
    targets = bench_binary_framing, bench_websocket_frames, bench_websocket_handshake
}
criterion_main!(benches);
