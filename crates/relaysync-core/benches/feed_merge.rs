//! Feed view merge and filter set benchmarks for relaysync-core.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use relaysync_core::FeedView;
use relaysync_protocol::{kind, Event, Filter, FilterSetKey};
use std::sync::Arc;

fn events(count: u64) -> Vec<Arc<Event>> {
    (0..count)
        .map(|i| {
            // Scatter timestamps so inserts land all over the view.
            let at = 1_700_000_000 + (i * 7919) % count;
            Arc::new(Event::new(format!("{i:064x}"), "alice", kind::SHORT_VIDEO, at))
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed_view");
    for count in [100u64, 1_000, 10_000] {
        let batch = events(count);
        group.throughput(Throughput::Elements(count));
        group.bench_function(format!("extend_{count}"), |b| {
            b.iter_batched(
                || batch.clone(),
                |batch| {
                    let mut view = FeedView::new();
                    view.extend(batch);
                    black_box(view.cursor())
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_merge_duplicates(c: &mut Criterion) {
    let batch = events(1_000);
    let mut view = FeedView::new();
    view.extend(batch.clone());

    c.bench_function("extend_1000_all_duplicates", |b| {
        b.iter(|| view.clone().extend(black_box(batch.clone())))
    });
}

fn bench_filter_set_key(c: &mut Criterion) {
    let filters: Vec<Filter> = (0..4)
        .map(|i| {
            Filter::new()
                .kinds(kind::VIDEO_KINDS)
                .authors((0..50).map(|a| format!("{:064}", a + i * 50)))
                .limit(50)
        })
        .collect();

    c.bench_function("filter_set_key_4x50_authors", |b| {
        b.iter(|| FilterSetKey::new(black_box(&filters)))
    });
}

criterion_group!(
    benches,
    bench_merge,
    bench_merge_duplicates,
    bench_filter_set_key
);
criterion_main!(benches);
