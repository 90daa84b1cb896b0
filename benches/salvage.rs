//! Benchmarks for completion salvage and consolidation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kg_loom::graph::consolidate::{deduplicate, ConsolidationPass, StandardizationMapping};
use kg_loom::graph::Triple;
use kg_loom::salvage;

fn fact_records(n: usize) -> String {
    let records: Vec<String> = (0..n)
        .map(|i| {
            format!(
                r#"{{"subject": "Person {i}", "predicate": "works at", "object": "Company {}", "time": "20{:02}"}}"#,
                i % 7,
                i % 100
            )
        })
        .collect();
    format!("[{}]", records.join(",\n"))
}

fn bench_direct(c: &mut Criterion) {
    let text = fact_records(200);
    c.bench_function("salvage_direct_200", |bench| {
        bench.iter(|| black_box(salvage::parse(black_box(&text)).unwrap()))
    });
}

fn bench_truncated(c: &mut Criterion) {
    let full = fact_records(200);
    let text = format!("Here you go:\n```json\n{}", &full[..full.len() - 40]);
    c.bench_function("salvage_truncated_200", |bench| {
        bench.iter(|| black_box(salvage::parse(black_box(&text)).unwrap()))
    });
}

fn bench_repaired(c: &mut Criterion) {
    let text = fact_records(200)
        .replace(r#""predicate":"#, "predicate:")
        .replace("}]", "},]");
    c.bench_function("salvage_repaired_200", |bench| {
        bench.iter(|| black_box(salvage::parse(black_box(&text)).unwrap()))
    });
}

fn triples(n: usize) -> Vec<Triple> {
    (0..n)
        .map(|i| {
            Triple::parse(
                &format!("ENTITY|Person {}", i % 500),
                "works at",
                &format!("ENTITY|Company {}", i % 37),
            )
            .unwrap()
        })
        .collect()
}

fn bench_deduplicate(c: &mut Criterion) {
    let input = triples(5_000);
    c.bench_function("deduplicate_5k", |bench| {
        bench.iter(|| black_box(deduplicate(input.clone())))
    });
}

fn bench_consolidate(c: &mut Criterion) {
    let input = triples(5_000);
    let mapping = StandardizationMapping::from_groups(
        (0..37).map(|i| (format!("Company {i}"), vec![format!("Company {i} Inc.")])),
    );
    c.bench_function("consolidate_5k", |bench| {
        bench.iter(|| {
            black_box(
                ConsolidationPass::new()
                    .with_mapping(&mapping)
                    .run(input.clone()),
            )
        })
    });
}

criterion_group!(
    benches,
    bench_direct,
    bench_truncated,
    bench_repaired,
    bench_deduplicate,
    bench_consolidate
);
criterion_main!(benches);
