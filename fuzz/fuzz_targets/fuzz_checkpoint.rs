//! Fuzz target for checkpoint decoding.
//!
//! Arbitrary JSON must decode to a checkpoint or a codec error, and a
//! decoded checkpoint must survive re-encoding unchanged.

#![no_main]

use inbox_replication::{Checkpoint, Collection};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    for collection in [Collection::Messages, Collection::Threads] {
        if let Ok(checkpoint) = Checkpoint::decode(collection, &value) {
            let again = Checkpoint::decode(collection, &checkpoint.encode(collection))
                .expect("encoded checkpoint must decode");
            assert_eq!(again, checkpoint);
        }
    }
});
