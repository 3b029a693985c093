//! Fuzz target for worker protocol line decoding.
//!
//! Arbitrary input must decode to a message or an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use snippet_pool::protocol::{decode_coordinator_message, decode_worker_message, encode_line};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = decode_worker_message(line) {
        // Anything accepted must survive re-encoding.
        let _ = encode_line(&message);
    }
    let _ = decode_coordinator_message(line);
});
