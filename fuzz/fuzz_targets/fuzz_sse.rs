//! Fuzz target for the live-stream SSE decoder.
//!
//! Chunk boundaries must not change the decoded payloads.

#![no_main]

use inbox_replication::remote::SseDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], u8)| {
    let (stream, split) = data;

    let mut whole = SseDecoder::new();
    let mut expected = whole.feed(stream);
    expected.extend(whole.finish());

    let step = usize::from(split).max(1);
    let mut chunked = SseDecoder::new();
    let mut actual = Vec::new();
    for chunk in stream.chunks(step) {
        actual.extend(chunked.feed(chunk));
    }
    actual.extend(chunked.finish());

    assert_eq!(actual, expected);
});
