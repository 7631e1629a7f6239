//! Benchmarks for citation verification.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lessonflow::citations::{verify_snippet, SourceIndex};

fn source_text(paragraphs: usize) -> String {
    "Employees must wear protective gear on the warehouse floor at all times. \
     Report every spill to a supervisor before continuing work. "
        .repeat(paragraphs)
}

fn verifier_benchmark(c: &mut Criterion) {
    let source = source_text(200);
    let index = SourceIndex::new(&source);

    c.bench_function("verify_exact", |b| {
        b.iter(|| index.check(black_box("report every spill to a supervisor")));
    });

    c.bench_function("verify_partial", |b| {
        b.iter(|| index.check(black_box("employees wear gear on the floor at all hours")));
    });

    c.bench_function("verify_unindexed", |b| {
        b.iter(|| verify_snippet(black_box("a quote that appears nowhere"), black_box(&source)));
    });
}

criterion_group!(benches, verifier_benchmark);
criterion_main!(benches);
