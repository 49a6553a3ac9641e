use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use slipwire_proto::frame::{Chunk, ChunkFlags, PeerFooter, PeerHeader};
use slipwire_proto::message::Message;

fn bench_chunk_parse(c: &mut Criterion) {
    let body = vec![0xAA; 1202];
    let header = PeerHeader {
        session_id: 7,
        chunk_id: 1,
        offset: 0,
        total_size: 1202,
        length: body.len() as u32,
        flags: ChunkFlags::new().with_file(),
        ..PeerHeader::default()
    };
    let framed = Chunk::build(&header, &body, &PeerFooter { value: 2 });

    let mut group = c.benchmark_group("chunk_parse");
    group.throughput(Throughput::Bytes(framed.len() as u64));
    group.bench_function("parse_1202_bytes", |b| {
        b.iter(|| Chunk::parse(black_box(&framed)))
    });
    group.finish();
}

fn bench_chunk_build(c: &mut Criterion) {
    let body = vec![0xBB; 1202];
    let header = PeerHeader {
        session_id: 7,
        chunk_id: 1,
        offset: 0,
        total_size: 1202,
        length: body.len() as u32,
        flags: ChunkFlags::new().with_file(),
        ..PeerHeader::default()
    };
    let footer = PeerFooter { value: 2 };

    let mut group = c.benchmark_group("chunk_build");
    group.throughput(Throughput::Bytes(1254));
    group.bench_function("build_1202_bytes", |b| {
        b.iter(|| Chunk::build(black_box(&header), black_box(&body), black_box(&footer)))
    });
    group.finish();
}

fn bench_message_payload(c: &mut Criterion) {
    let body = vec![0xCC; 1202];
    let header = PeerHeader {
        session_id: 7,
        chunk_id: 1,
        offset: 0,
        total_size: 1202,
        length: body.len() as u32,
        flags: ChunkFlags::new().with_file(),
        ..PeerHeader::default()
    };
    let msg = Message::peer(header, body, PeerFooter { value: 2 });
    let payload = msg.gen_payload();

    let mut group = c.benchmark_group("message_payload");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("gen", |b| b.iter(|| black_box(&msg).gen_payload()));
    group.bench_function("parse", |b| {
        b.iter(|| Message::parse_payload(black_box(&payload)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_parse,
    bench_chunk_build,
    bench_message_payload
);
criterion_main!(benches);
