use agreement_retirement_core::{
    evaluate_time_interval, InMemoryRetirementStore, RetirementQuery, RetirementRecord,
    RetirementStore,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::{Duration, OffsetDateTime};

fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

fn seeded_store(count: usize) -> InMemoryRetirementStore {
    let store = InMemoryRetirementStore::new();
    for index in 0..count {
        let offset = i64::try_from(index).unwrap_or(i64::MAX);
        let record = RetirementRecord::new(
            format!("agreement-{index:06}"),
            if index % 3 == 0 { "POLICY_VIOLATION:c-1" } else { "MANUAL" },
            "bench",
            fixture_time() + Duration::seconds(offset),
        );
        if let Err(err) = store.insert_if_absent(&record) {
            panic!("bench fixture insert failed: {err}");
        }
    }
    store
}

fn bench_time_interval(c: &mut Criterion) {
    let from = fixture_time().unix_timestamp().to_string();
    c.bench_function("time_interval_epoch_bounds", |b| {
        b.iter(|| evaluate_time_interval(fixture_time(), Some(&from), Some("2030-01-01T00:00:00Z")));
    });
}

fn bench_point_lookup(c: &mut Criterion) {
    let store = seeded_store(10_000);
    c.bench_function("in_memory_point_lookup_10k", |b| {
        b.iter(|| store.get_by_agreement_id("agreement-004242"));
    });

    let query = match (RetirementQuery {
        reason_prefix: Some("POLICY_VIOLATION:".to_string()),
        limit: Some(100),
        ..RetirementQuery::default()
    })
    .compile()
    {
        Ok(query) => query,
        Err(err) => panic!("bench query should compile: {err}"),
    };
    c.bench_function("in_memory_prefix_query_10k", |b| {
        b.iter(|| store.query(&query));
    });
}

criterion_group!(benches, bench_time_interval, bench_point_lookup);
criterion_main!(benches);
