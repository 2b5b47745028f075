//! 帧编解码基准测试
//!
//! 测试单帧编码、解码以及批量拆包的吞吐

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use im_gateway_core::domain::model::{ChatMessage, ChatPayload, Frame};
use im_gateway_core::infrastructure::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, Inbound};
use tokio_util::codec::{Decoder, Encoder};

fn push_frame(content_len: usize) -> Frame {
    let message = ChatMessage::private(
        1_234_567,
        10,
        ChatPayload {
            receiver_id: 20,
            content_type: 1,
            content: "x".repeat(content_len),
            client_msg_no: Some("c-1".to_string()),
            extra: None,
        },
    );
    message.to_push_frame().expect("encodable message")
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for size in [64usize, 1024, 16 * 1024] {
        let frame = push_frame(size);
        group.throughput(Throughput::Bytes(frame.encoded_len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH);
            let mut buf = BytesMut::with_capacity(frame.encoded_len());
            b.iter(|| {
                buf.clear();
                codec.encode(frame.clone(), &mut buf).expect("encode");
                black_box(buf.len())
            })
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for size in [64usize, 1024, 16 * 1024] {
        let mut encoded = BytesMut::new();
        FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH)
            .encode(push_frame(size), &mut encoded)
            .expect("encode");
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH);
            b.iter(|| {
                let mut src = encoded.clone();
                match codec.decode(&mut src).expect("decode") {
                    Some(Inbound::Frame(frame)) => black_box(frame.message_id),
                    other => panic!("unexpected decode result: {other:?}"),
                }
            })
        });
    }
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    // 一次读到 128 个心跳帧时的拆包开销
    let mut stream = BytesMut::new();
    let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH);
    for id in 0..128 {
        codec
            .encode(Frame::heartbeat_response(id), &mut stream)
            .expect("encode");
    }

    c.bench_function("frame_decode_stream_128", |b| {
        b.iter(|| {
            let mut src = stream.clone();
            let mut decoded = 0usize;
            while let Some(inbound) = codec.decode(&mut src).expect("decode") {
                black_box(inbound);
                decoded += 1;
            }
            black_box(decoded)
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_stream);
criterion_main!(benches);
