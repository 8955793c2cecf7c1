use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_reactor::{Buffer, EventLoopThread};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

fn bench_append_retrieve(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_append_retrieve");

    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let mut buf = Buffer::new();
            b.iter(|| {
                buf.append(black_box(payload));
                let half = buf.readable_bytes() / 2;
                buf.retrieve(half);
                black_box(buf.peek().len());
                buf.retrieve_all();
            });
        });
    }
    group.finish();
}

fn bench_length_prefixed_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_frames");

    group.bench_function("prepend_then_read", |b| {
        let body = vec![7u8; 512];
        let mut buf = Buffer::new();
        b.iter(|| {
            for _ in 0..32 {
                buf.append(&body);
                buf.prepend_i32(body.len() as i32);
                let len = buf.read_i32() as usize;
                black_box(buf.retrieve_as_bytes(len));
            }
        });
    });
    group.finish();
}

fn bench_read_from_socket(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_read_from");
    let size = 64 * 1024;
    group.throughput(Throughput::Bytes(size as u64));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut writer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut reader, _) = listener.accept().unwrap();
    let chunk = vec![1u8; size];

    group.bench_function("loopback_64k", |b| {
        let mut buf = Buffer::new();
        b.iter(|| {
            writer.write_all(&chunk).unwrap();
            while buf.readable_bytes() < size {
                let n = buf.read_from(&mut reader).unwrap();
                assert_ne!(n, 0);
            }
            buf.retrieve_all();
        });
    });
    group.finish();
}

fn bench_cross_thread_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_in_loop");
    let mut loop_thread = EventLoopThread::new("bench-loop", None);
    let event_loop = loop_thread.start_loop().unwrap();

    group.bench_function("round_trip", |b| {
        b.iter(|| {
            let done = Arc::new(AtomicBool::new(false));
            let d = done.clone();
            event_loop.queue_in_loop(move || d.store(true, Ordering::Release));
            while !done.load(Ordering::Acquire) {
                thread::yield_now();
            }
        });
    });

    group.bench_function("batch_of_100", |b| {
        b.iter(|| {
            let done = Arc::new(AtomicBool::new(false));
            for _ in 0..99 {
                event_loop.queue_in_loop(|| {});
            }
            let d = done.clone();
            event_loop.queue_in_loop(move || d.store(true, Ordering::Release));
            while !done.load(Ordering::Acquire) {
                thread::yield_now();
            }
        });
    });
    group.finish();
    drop(loop_thread);
}

criterion_group!(
    benches,
    bench_append_retrieve,
    bench_length_prefixed_frames,
    bench_read_from_socket,
    bench_cross_thread_queue
);
criterion_main!(benches);
