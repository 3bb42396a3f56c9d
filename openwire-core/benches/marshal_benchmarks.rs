//! Marshaling throughput benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use openwire_core::commands::{Destination, Message, MessageId, ProducerId};
use openwire_core::serialization::{map_from_bytes, map_to_bytes, BooleanStream, ByteOutput};
use openwire_core::{Command, OpenWireCodec, OpenWireFormat, PrimitiveMap, WireFormatSettings};
use tokio_util::codec::{Decoder, Encoder};

fn format(tight: bool, cache: bool) -> OpenWireFormat {
    OpenWireFormat::new(
        WireFormatSettings::builder()
            .tight_encoding_enabled(tight)
            .cache_enabled(cache)
            .build()
            .unwrap(),
    )
}

fn sample_message(body_len: usize) -> Command {
    let producer = ProducerId::new("ID:bench-host-1", 1, 1);
    let mut message = Message::text(&"x".repeat(body_len));
    message.producer_id = Some(producer.clone());
    message.message_id = Some(MessageId::new(producer, 1));
    message.destination = Some(Destination::queue("bench.queue"));
    message.persistent = true;
    message.timestamp = 1_700_000_000_000;
    message.into()
}

fn bench_boolean_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("boolean_stream");

    group.bench_function("write_1000", |b| {
        b.iter(|| {
            let mut bs = BooleanStream::new();
            for i in 0..1000 {
                bs.write_boolean(black_box(i % 3 == 0));
            }
            let mut out = ByteOutput::new();
            bs.marshal(&mut out).unwrap();
            black_box(out.len())
        })
    });

    group.finish();
}

fn bench_marshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal_text_message");

    for body_len in [16usize, 1024, 64 * 1024] {
        let command = sample_message(body_len);
        group.throughput(Throughput::Bytes(body_len as u64));

        for (label, tight, cache) in [("tight", true, true), ("loose", false, false)] {
            group.bench_with_input(
                BenchmarkId::new(label, body_len),
                &command,
                |b, command| {
                    let mut wf = format(tight, cache);
                    b.iter(|| black_box(wf.marshal_to_vec(black_box(command)).unwrap()))
                },
            );
        }
    }

    group.finish();
}

fn bench_unmarshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("unmarshal_text_message");

    for body_len in [16usize, 1024, 64 * 1024] {
        let command = sample_message(body_len);
        group.throughput(Throughput::Bytes(body_len as u64));

        for (label, tight) in [("tight", true), ("loose", false)] {
            let frame = format(tight, false).marshal_to_vec(&command).unwrap();
            group.bench_with_input(BenchmarkId::new(label, body_len), &frame, |b, frame| {
                let mut wf = format(tight, false);
                b.iter(|| black_box(wf.unmarshal_from_slice(black_box(frame)).unwrap()))
            });
        }
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let command = sample_message(256);

    group.bench_function("encode_decode_100", |b| {
        b.iter(|| {
            let mut encoder = OpenWireCodec::new(format(true, true));
            let mut decoder = OpenWireCodec::new(format(true, true));
            let mut buf = BytesMut::new();
            for _ in 0..100 {
                encoder.encode(command.clone(), &mut buf).unwrap();
            }
            let mut decoded = 0;
            while let Some(command) = decoder.decode(&mut buf).unwrap() {
                black_box(command);
                decoded += 1;
            }
            decoded
        })
    });

    group.finish();
}

fn bench_primitive_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("primitive_map");

    let mut map = PrimitiveMap::new();
    for i in 0..32 {
        map.insert(format!("string-{}", i), format!("value-{}", i));
        map.insert(format!("int-{}", i), i);
        map.insert(format!("flag-{}", i), i % 2 == 0);
    }
    let bytes = map_to_bytes(&map).unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(map_to_bytes(black_box(&map)).unwrap()))
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(map_from_bytes(black_box(&bytes)).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_boolean_stream,
    bench_marshal,
    bench_unmarshal,
    bench_codec,
    bench_primitive_map
);
criterion_main!(benches);
