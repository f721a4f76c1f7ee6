//! Fuzzing library for corpus-curator.
//!
//! Targets cover everything that parses untrusted input: classifier
//! replies, source records and review files.
//!
//! # Usage
//!
//! ```bash
//! cd crates/curator-fuzz
//! cargo +nightly fuzz run fuzz_classifier_response -- -max_total_time=60
//! ```

pub use corpus_curator::{classifier, dedup, models};
