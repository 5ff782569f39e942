//! Benchmarks for the output hot path.
//!
//! Every chunk a shell prints goes through the scrollback, gets framed as
//! JSON and is fanned out to each attached client. Client frames are decoded
//! on every keystroke.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::protocol::{ClientMessage, Frame, ServerMessage};
use daemon::session::{ScrollbackBuffer, SessionRelay};

const SCROLLBACK_BYTES: usize = 200_000;

/// Appending output chunks to a full scrollback (eviction on every push).
fn bench_scrollback_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("scrollback_append");

    for size in [16usize, 1024, 16 * 1024] {
        let chunk = "x".repeat(size);
        let mut buffer = ScrollbackBuffer::new(SCROLLBACK_BYTES);
        while buffer.len() + size <= SCROLLBACK_BYTES {
            buffer.append(&chunk);
        }

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunk, |b, chunk| {
            b.iter(|| buffer.append(black_box(chunk)));
        });
    }

    group.finish();
}

/// Building the replay for a newly attached client.
fn bench_scrollback_replay(c: &mut Criterion) {
    let mut buffer = ScrollbackBuffer::new(SCROLLBACK_BYTES);
    let line = "drwxr-xr-x  2 user user 4096 Jan  1 00:00 some-directory\r\n";
    while buffer.len() + line.len() <= SCROLLBACK_BYTES {
        buffer.append(line);
    }

    let mut group = c.benchmark_group("scrollback_replay");
    group.throughput(Throughput::Bytes(buffer.len() as u64));
    group.bench_function("full_200KB", |b| {
        b.iter(|| black_box(buffer.get_all()));
    });
    group.finish();
}

/// Encoding output frames and decoding client frames.
fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    let output = ServerMessage::output("\x1b[32m$\x1b[0m ls -la\r\n".repeat(32));
    group.bench_function("encode_output", |b| {
        b.iter(|| black_box(&output).to_json());
    });

    let keystroke = ClientMessage::input("l").to_json().unwrap();
    group.bench_function("decode_input", |b| {
        b.iter(|| Frame::<ClientMessage>::decode(black_box(&keystroke)));
    });

    let resize = r#"{"type":"resize","cols":120,"rows":40}"#;
    group.bench_function("decode_resize", |b| {
        b.iter(|| Frame::<ClientMessage>::decode(black_box(resize)));
    });

    group.bench_function("decode_raw", |b| {
        b.iter(|| Frame::<ClientMessage>::decode(black_box("echo hello\r")));
    });

    group.finish();
}

/// Fan-out of one chunk to a number of attached clients.
fn bench_relay_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("relay_publish");
    let chunk = "output line\r\n".repeat(8);

    for clients in [1usize, 4, 16] {
        let relay = SessionRelay::new(SCROLLBACK_BYTES);
        let mut receivers = Vec::new();
        runtime.block_on(async {
            for i in 0..clients {
                receivers.push(relay.attach(format!("client-{i}")).await);
            }
        });

        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &chunk, |b, chunk| {
            b.iter(|| {
                runtime.block_on(async {
                    relay.publish(black_box(chunk)).await;
                    for rx in receivers.iter_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scrollback_append,
    bench_scrollback_replay,
    bench_frames,
    bench_relay_publish,
);
criterion_main!(benches);
