//! 🏎️ How fast can bytes cross the relay, raw and wrapped in a zip?
//!
//! `cargo bench --bench relay_bench`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use s3zip::archive::ZipEncoder;
use s3zip::relay::{RelayConfig, relay};

const PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

fn payload() -> Vec<u8> {
    // -- 🎲 half text, half noise; deflate gets something to chew on but not a free lunch
    let mut seed = 0x9e37_79b9_7f4a_7c15u64;
    (0..PAYLOAD_BYTES)
        .map(|i| {
            if i % 2 == 0 {
                b"s3zip"[i % 5]
            } else {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as u8
            }
        })
        .collect()
}

fn bench_relay(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let data = payload();

    let mut group = c.benchmark_group("relay");
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    group.sample_size(10);

    for chunk in [16 * 1024, 64 * 1024, 256 * 1024] {
        group.bench_with_input(BenchmarkId::new("raw", chunk), &chunk, |b, &chunk| {
            b.to_async(&runtime).iter(|| async {
                let (mut writer, mut reader, _) = relay(RelayConfig::new(1024 * 1024, chunk));
                let consumer = tokio::spawn(async move { reader.drain().await });
                for piece in data.chunks(chunk) {
                    writer.write(piece).await.expect("write");
                }
                writer.close();
                consumer.await.expect("join").expect("drain")
            });
        });
    }

    group.bench_function("zip_one_entry", |b| {
        b.to_async(&runtime).iter(|| async {
            let (writer, mut reader, _) = relay(RelayConfig::default());
            let consumer = tokio::spawn(async move { reader.drain().await });
            let mut encoder = ZipEncoder::new(writer);
            encoder.open_entry("payload.bin").await.expect("open");
            for piece in data.chunks(64 * 1024) {
                encoder.write(piece).await.expect("write");
            }
            encoder.finalize().await.expect("finalize");
            encoder.sink_mut().close();
            consumer.await.expect("join").expect("drain")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_relay);
criterion_main!(benches);
