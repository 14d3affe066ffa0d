//! Benchmarks for the cell sandbox.
//!
//! Run with: cargo bench

use std::sync::Arc;

use cellbox::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Benchmark session startup and teardown.
fn bench_session_lifecycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("session");
    group.sample_size(20);

    group.bench_function("create_dispose", |b| {
        b.to_async(&rt).iter(|| async {
            let session = SandboxSession::create(SandboxConfig::default()).await.unwrap();
            session.dispose().await;
        });
    });

    group.finish();
}

/// Benchmark session-scope evaluation.
fn bench_eval(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let session = rt
        .block_on(SandboxSession::create(SandboxConfig::default()))
        .unwrap();

    let mut group = c.benchmark_group("eval");

    for (name, source) in [
        ("arithmetic", "1 + 1"),
        ("loop_1000", "{ let s = 0; for (let i = 0; i < 1000; i++) s += i; s }"),
        ("object_result", "({ a: [1, 2, 3], b: { c: 'd' }, e: null })"),
        ("promise", "Promise.resolve(20).then(x => x * 2)"),
        ("date_format", "_internals.formatDateTime('2024-03-05T12:00:00Z', 'en-US', {dateStyle: 'long', timeZone: 'UTC'})"),
    ] {
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                let out = session.eval_async(source).await.unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
    rt.block_on(session.dispose());
}

/// Benchmark independent sessions evaluating in parallel.
fn bench_concurrent_sessions(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    for concurrency in [1, 2, 4, 8].iter() {
        let sessions: Vec<SandboxSession> = rt.block_on(async {
            let mut sessions = Vec::new();
            for _ in 0..*concurrency {
                sessions.push(SandboxSession::create(SandboxConfig::default()).await.unwrap());
            }
            sessions
        });

        group.throughput(Throughput::Elements(*concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("evaluations", concurrency),
            &sessions,
            |b, sessions| {
                b.to_async(&rt).iter(|| async {
                    let mut handles = Vec::new();
                    for session in sessions {
                        let session = session.clone();
                        handles.push(tokio::spawn(async move {
                            session
                                .eval_async("{ let s = 0; for (let i = 0; i < 10000; i++) s += i; s }")
                                .await
                                .unwrap()
                        }));
                    }
                    for handle in handles {
                        black_box(handle.await.unwrap());
                    }
                });
            },
        );

        rt.block_on(async {
            for session in &sessions {
                session.dispose().await;
            }
        });
    }

    group.finish();
}

/// Benchmark a full cell re-run: supersede, resolve, evaluate, deliver.
fn bench_cell_rerun(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let document = Arc::new(Document::new(vec![Node::element(
        "code_block",
        vec![Node::cell("c1", "here().position + 1")],
    )]));
    let id = CellId::from("c1");

    let (evaluator, mut results) = rt.block_on(async {
        let session = SandboxSession::create(SandboxConfig::default()).await.unwrap();
        let evaluator = CellEvaluator::new(session, document.clone()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        evaluator
            .subscribe(&id, move |result| {
                let _ = tx.send(result.is_ok());
            })
            .unwrap();
        evaluator
            .mount(CellSpec::new("c1", "here().position + 1"))
            .unwrap();
        (evaluator, rx)
    });
    rt.block_on(results.recv());

    let mut group = c.benchmark_group("cell");
    group.bench_function("rerun", |b| {
        b.iter(|| {
            rt.block_on(async {
                evaluator.trigger(&id).unwrap();
                black_box(results.recv().await)
            })
        });
    });
    group.finish();

    rt.block_on(evaluator.dispose());
}

criterion_group!(
    benches,
    bench_session_lifecycle,
    bench_eval,
    bench_concurrent_sessions,
    bench_cell_rerun,
);

criterion_main!(benches);
