use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scorekeep::admission::{AdmissionGate, AdmissionPolicies};
use scorekeep::model::Caller;
use std::time::Duration;
use tokio::time::Instant;

fn bench_admit_single_key(c: &mut Criterion) {
    let gate = AdmissionGate::new();
    let window = Duration::from_secs(3600);
    let now = Instant::now();

    c.bench_function("admit_single_key", |b| {
        b.iter(|| black_box(gate.admit_at("user:42", u32::MAX, window, now)))
    });
}

fn bench_admit_many_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_many_keys");
    let window = Duration::from_secs(3600);

    for key_count in [100usize, 10_000, 100_000].iter() {
        let keys: Vec<String> = (0..*key_count).map(|i| format!("ip:10.0.{}.{}", i / 256, i % 256)).collect();
        let gate = AdmissionGate::new();
        let now = Instant::now();

        group.bench_with_input(BenchmarkId::from_parameter(key_count), key_count, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(gate.admit_at(&keys[i], 30, window, now))
            })
        });
    }

    group.finish();
}

fn bench_check_caller(c: &mut Criterion) {
    let gate = AdmissionGate::new();
    let policies = AdmissionPolicies::default();
    let caller = Caller {
        ip: Some("203.0.113.9".to_string()),
        installation_id: Some("inst-1".to_string()),
        ..Caller::user("42")
    };

    // Past the first few iterations every check is a denial.
    c.bench_function("check_caller_three_keys", |b| {
        b.iter(|| black_box(gate.check(&caller, &policies).is_ok()))
    });
}

fn bench_sweep(c: &mut Criterion) {
    let window = Duration::from_secs(1);
    c.bench_function("sweep_10k_expired", |b| {
        b.iter_with_setup(
            || {
                let gate = AdmissionGate::new();
                let start = Instant::now();
                for i in 0..10_000 {
                    gate.admit_at(&format!("user:{}", i), 10, window, start);
                }
                (gate, start + Duration::from_secs(2))
            },
            |(gate, later)| black_box(gate.sweep_at(later)),
        )
    });
}

criterion_group!(
    benches,
    bench_admit_single_key,
    bench_admit_many_keys,
    bench_check_caller,
    bench_sweep
);
criterion_main!(benches);
