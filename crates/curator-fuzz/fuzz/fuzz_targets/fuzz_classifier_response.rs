#![no_main]

use libfuzzer_sys::fuzz_target;
use corpus_curator::classifier::parse_batch_response;

fuzz_target!(|data: &[u8]| {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        let ids = vec!["p1".to_string(), "p2".to_string(), "p3".to_string()];
        let parsed = parse_batch_response(&json, &ids);
        // At most one result per expected id, never an unknown one
        assert!(parsed.len() <= ids.len());
        assert!(parsed.keys().all(|id| ids.contains(id)));
    }
});
