use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use slotmux::{select_with, Candidate, SeedStrategy, SelectionParams};
use std::hint::black_box;

fn bench_selection(c: &mut Criterion) {
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap();
    let params = SelectionParams {
        policy_version: "bench".to_string(),
        policy_revision: 0,
        bias: 0.0,
        temperature: 0.7,
        top_k: 10,
        epsilon: 0.05,
        slot_duration_minutes: 30,
        global_seed: 4242,
        seed_strategy: SeedStrategy::WindowSlot,
    };

    let mut group = c.benchmark_group("gumbel_top_k");
    for n in [16usize, 256, 4096] {
        let cands: Vec<Candidate> = (0..n)
            .map(|i| Candidate::new(format!("c{i:05}"), ((i * 7919) % 1000) as f64 / 1000.0))
            .collect();
        group.bench_with_input(BenchmarkId::new("select", n), &cands, |b, cands| {
            let mut w = 0u64;
            b.iter(|| {
                // Fresh window per iteration so the seed (and noise) changes.
                w += 1;
                let d = select_with(cands, &params, t0, &format!("w{w}")).unwrap();
                black_box(d.len());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_selection);
criterion_main!(benches);
