//! Fuzz target for pkt-line decoding.
//!
//! The reader must reject malformed framing with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = gitgate_git::PktLineReader::new(Cursor::new(data));

    // Bounded so crafted input cannot loop forever.
    for _ in 0..100 {
        match reader.read() {
            Ok(Some(pkt)) => {
                let _ = pkt.band();
            }
            Ok(None) | Err(_) => break,
        }
    }
});
