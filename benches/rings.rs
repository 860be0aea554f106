use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sysstatd::trackers::ring::{DeltaRing, SampleWindow};

fn bench_sample_window(c: &mut Criterion) {
    c.bench_function("sample_window/push_full_window", |b| {
        b.iter(|| {
            let mut w = SampleWindow::new(300);
            for i in 0..600u64 {
                let sample = if i % 7 == 0 { None } else { Some(i % 40) };
                w.push(black_box(sample));
            }
            black_box(w.average())
        })
    });

    c.bench_function("sample_window/steady_state_push", |b| {
        let mut w = SampleWindow::new(300);
        for i in 0..300u64 {
            w.push(Some(i));
        }
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            w.push(black_box(Some(i % 50)));
            black_box(w.average())
        })
    });
}

fn bench_delta_ring(c: &mut Criterion) {
    c.bench_function("delta_ring/push_and_loads", |b| {
        let mut ring = DeltaRing::new(900, 300);
        for i in 0..900u64 {
            ring.push(i % 1000);
        }
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(17);
            ring.push(black_box(i % 1000));
            black_box((ring.load_short(), ring.load_full()))
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_sample_window(c);
    bench_delta_ring(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
