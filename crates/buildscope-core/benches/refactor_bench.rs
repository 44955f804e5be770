//! # Refactoring Benchmarks
//!
//! Performance benchmarks for buildscope-core refactorings.
//!
//! Run with: `cargo bench -p buildscope-core`

use buildscope_core::{
    ActionId, BuildGraph, MemberRef, OperationType, PathId, RefactorSession, session_to_bytes,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

/// A linear pipeline under one `make` action: step i reads `f{i}` and
/// writes `f{i+1}`.
fn create_pipeline(size: usize) -> (BuildGraph, ActionId, Vec<ActionId>) {
    let mut graph = BuildGraph::new();
    let make = graph
        .add_action(ActionId::ROOT, "make", PathId::ROOT)
        .expect("action");
    let mut steps = Vec::with_capacity(size);
    let mut input = graph.add_file("/pkg/f0").expect("file");
    for i in 0..size {
        let output = graph
            .add_file(&format!("/pkg/f{}", i.saturating_add(1)))
            .expect("file");
        let step = graph
            .add_action(make, &format!("step {}", i), PathId::ROOT)
            .expect("action");
        graph
            .record_access(step, input, OperationType::Read)
            .expect("link");
        graph
            .record_access(step, output, OperationType::Write)
            .expect("link");
        steps.push(step);
        input = output;
    }
    (graph, make, steps)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_delete_action_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete_action_tree");

    for size in [100, 1000].iter() {
        let (graph, make, _) = create_pipeline(*size);
        let mut session = RefactorSession::new(graph);

        group.bench_with_input(BenchmarkId::from_parameter(size), &make, |b, &make| {
            b.iter(|| {
                session.delete_action_tree(make).expect("delete");
                black_box(session.undo().expect("undo"))
            });
        });
    }

    group.finish();
}

fn bench_make_atomic(c: &mut Criterion) {
    let mut group = c.benchmark_group("make_action_atomic");

    for size in [100, 1000].iter() {
        let (graph, make, _) = create_pipeline(*size);
        let mut session = RefactorSession::new(graph);

        group.bench_with_input(BenchmarkId::from_parameter(size), &make, |b, &make| {
            b.iter(|| {
                session.make_action_atomic(make).expect("flatten");
                black_box(session.undo().expect("undo"))
            });
        });
    }

    group.finish();
}

fn bench_move_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("move_to_package");

    for size in [10, 100].iter() {
        let (mut graph, _, steps) = create_pipeline(*size);
        let root = graph.lookup_path("/pkg").expect("root");
        let package = graph.add_package("pkg", Some(root)).expect("package");
        let last = *steps.last().expect("steps");
        let mut session = RefactorSession::new(graph);

        group.bench_with_input(BenchmarkId::from_parameter(size), &last, |b, &last| {
            b.iter(|| {
                session
                    .move_to_package(&[MemberRef::Action(last)], package)
                    .expect("move");
                black_box(session.undo().expect("undo"))
            });
        });
    }

    group.finish();
}

fn bench_persist(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_to_bytes");

    for size in [100, 1000].iter() {
        let (graph, _, _) = create_pipeline(*size);
        let session = RefactorSession::new(graph);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(session_to_bytes(&session)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_delete_action_tree,
    bench_make_atomic,
    bench_move_chain,
    bench_persist,
);
criterion_main!(benches);
