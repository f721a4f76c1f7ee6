#![no_main]

use libfuzzer_sys::fuzz_target;
use corpus_curator::models::{QueryPlan, ReviewConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Ok(review) = serde_json::from_value::<ReviewConfig>(json.clone()) {
            let _ = review.validate();
        }
        let _ = QueryPlan::from_response(&json);
        let _ = serde_json::from_value::<QueryPlan>(json);
    }
});
