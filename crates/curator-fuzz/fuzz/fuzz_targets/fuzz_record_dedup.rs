#![no_main]

use libfuzzer_sys::fuzz_target;
use corpus_curator::dedup::Deduplicator;
use corpus_curator::models::{Paper, RawPaperRecord, Source};

fuzz_target!(|data: &[u8]| {
    let Ok(records) = serde_json::from_slice::<Vec<RawPaperRecord>>(data) else {
        return;
    };
    let papers: Vec<Paper> =
        records.into_iter().filter_map(|r| Paper::from_raw(r, Source::OpenAlex)).collect();
    let input = papers.len();
    let outcome = Deduplicator::default().deduplicate(papers);
    assert_eq!(outcome.papers.len() + outcome.duplicates_removed(), input);
});
