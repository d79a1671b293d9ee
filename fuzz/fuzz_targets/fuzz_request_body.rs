//! Fuzz target for request body buffering and decoding.

#![no_main]

use arbitrary::Arbitrary;
use gitgate_git::{BodyBuffer, ContentEncoding};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    encoding: u8,
    declared: Option<u16>,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let encoding = match input.encoding % 3 {
        0 => ContentEncoding::Identity,
        1 => ContentEncoding::Gzip,
        _ => ContentEncoding::Deflate,
    };
    let target = input.declared.map(u64::from);
    let mut buffer = BodyBuffer::new(encoding, target);

    for chunk in &input.chunks {
        match buffer.append(chunk) {
            Ok(true) => break,
            Ok(false) => {}
            Err(_) => return,
        }
    }

    if let Some(target) = target {
        assert!(buffer.received() <= target);
    }
    buffer.complete_now();
    let _ = buffer.finish();
});
