use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::stream::{self, StreamExt};
use std::convert::Infallible;

use claude_usage_gateway::encoder::StreamingEncoder;
use claude_usage_gateway::{ClientUsageRecord, UsageSnapshot, UsageSource};

fn sample_clients(count: usize) -> Vec<ClientUsageRecord> {
    let now = chrono::Utc::now();
    (0..count)
        .map(|i| {
            let mut record = ClientUsageRecord::new(format!("client-{}", i), now, now);
            record.hour_requests = i as u64;
            record.hour_cost = i as f64 * 0.01;
            record
        })
        .collect()
}

fn benchmark_buffered(c: &mut Criterion) {
    let encoder = StreamingEncoder::default();
    let snapshot = UsageSnapshot::empty(UsageSource::Ccusage);
    let clients = sample_clients(500);

    c.bench_function("encode_small_snapshot", |b| {
        b.iter(|| encoder.encode(black_box(&snapshot), true).unwrap())
    });

    c.bench_function("encode_500_clients_gzip", |b| {
        b.iter(|| encoder.encode(black_box(&clients), true).unwrap())
    });

    c.bench_function("encode_500_clients_plain", |b| {
        b.iter(|| encoder.encode(black_box(&clients), false).unwrap())
    });
}

fn benchmark_incremental(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let encoder = StreamingEncoder::default();
    let clients = sample_clients(500);

    for compress in [false, true] {
        let name = if compress {
            "incremental_500_clients_gzip"
        } else {
            "incremental_500_clients_plain"
        };
        c.bench_function(name, |b| {
            b.iter(|| {
                let items = stream::iter(clients.clone().into_iter().map(Ok::<_, Infallible>));
                runtime.block_on(async {
                    encoder
                        .encode_incremental(items, compress)
                        .fold(0usize, |len, chunk| async move { len + chunk.len() })
                        .await
                })
            })
        });
    }
}

criterion_group!(benches, benchmark_buffered, benchmark_incremental);
criterion_main!(benches);
