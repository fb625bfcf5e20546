//! Fuzz target for pull batch decoding.
//!
//! Decoding never panics, and order validation never panics on whatever
//! the decoder accepted.

#![no_main]

use inbox_replication::{ChangeBatch, Checkpoint, Collection};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let since = Checkpoint::origin();
    if let Ok(batch) = ChangeBatch::decode(Collection::Messages, "fuzz", &body, &since) {
        if batch.validate_order(&since).is_ok() {
            // A valid batch never moves the cursor backwards.
            assert!(batch.checkpoint >= since);
        }
    }
});
