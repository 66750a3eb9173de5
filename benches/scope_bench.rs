//! Benchmarks for scope open/close cycles and cascading release.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndscope::{DataType, HostBackend, RuntimeConfig, ScopeRuntime, Shape};
use std::sync::Arc;

fn runtime() -> ScopeRuntime {
    ScopeRuntime::new(Arc::new(HostBackend::new()), RuntimeConfig::default())
}

fn bench_scope_cycle(c: &mut Criterion) {
    let runtime = runtime();
    c.bench_function("scope_open_close_empty", |b| {
        b.iter(|| {
            let scope = runtime.new_scope(None).unwrap();
            scope.close().unwrap();
        })
    });
}

fn bench_cascade(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("cascade_release");
    for count in [8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let scope = runtime.new_scope(None).unwrap();
                for _ in 0..count {
                    black_box(
                        scope
                            .create(Shape::of(&[16]), DataType::F32, None)
                            .unwrap(),
                    );
                }
                scope.close().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_nested_scopes(c: &mut Criterion) {
    let runtime = runtime();
    c.bench_function("nested_scopes_depth_16", |b| {
        b.iter(|| {
            let top = runtime.new_scope(None).unwrap();
            let mut current = top.clone();
            for _ in 0..16 {
                let next = current.new_sub_scope(None).unwrap();
                next.create(Shape::of(&[4]), DataType::F32, None).unwrap();
                current = next;
            }
            top.close().unwrap();
        })
    });
}

fn bench_move_to(c: &mut Criterion) {
    let runtime = runtime();
    c.bench_function("move_between_scopes", |b| {
        b.iter(|| {
            let a = runtime.new_scope(None).unwrap();
            let b_scope = runtime.new_scope(None).unwrap();
            let array = a.create(Shape::of(&[16]), DataType::F32, None).unwrap();
            array.move_to(&b_scope).unwrap();
            array.move_to(&a).unwrap();
            a.close().unwrap();
            b_scope.close().unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_scope_cycle,
    bench_cascade,
    bench_nested_scopes,
    bench_move_to
);
criterion_main!(benches);
