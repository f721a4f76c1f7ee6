//! Deduplication throughput on synthetic search results.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use corpus_curator::dedup::{Deduplicator, normalize_title, token_set_similarity};
use corpus_curator::models::{Paper, RawPaperRecord, Source};

const WORDS: [&str; 12] = [
    "sleep", "memory", "consolidation", "adults", "recall", "spindle", "nap", "deprivation",
    "hippocampus", "learning", "motor", "episodic",
];

/// `n` papers where roughly one in five repeats an earlier title or DOI.
fn papers(n: usize) -> Vec<Paper> {
    (0..n)
        .filter_map(|i| {
            let base = if i % 5 == 4 { i - 1 } else { i };
            let title = (0..6).map(|k| WORDS[(base * 7 + k * 3) % WORDS.len()]).collect::<Vec<_>>();
            let source = if i % 2 == 0 { Source::OpenAlex } else { Source::SemanticScholar };
            Paper::from_raw(
                RawPaperRecord {
                    id: format!("p{i}"),
                    title: Some(format!("{} {base}", title.join(" "))),
                    year: Some(2015 + (base % 8) as i32),
                    doi: (base % 3 != 0).then(|| format!("10.1000/{base}")),
                    ..Default::default()
                },
                source,
            )
        })
        .collect()
}

fn bench_deduplicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("deduplicate");
    let dedup = Deduplicator::default();
    for n in [100, 500, 2000] {
        let input = papers(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &input, |b, input| {
            b.iter(|| dedup.deduplicate(black_box(input.clone())));
        });
    }
    group.finish();
}

fn bench_token_set_similarity(c: &mut Criterion) {
    let a = normalize_title("Slow-wave sleep boosts declarative memory consolidation in adults");
    let b = normalize_title("Slow wave sleep boosts declarative-memory consolidation in older adults");
    c.bench_function("token_set_similarity", |bench| {
        bench.iter(|| token_set_similarity(black_box(&a), black_box(&b)));
    });
}

criterion_group!(benches, bench_deduplicate, bench_token_set_similarity);
criterion_main!(benches);
