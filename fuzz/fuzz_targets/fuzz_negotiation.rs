//! Fuzz target for negotiation parsing of buffered request bodies.

#![no_main]

use gitgate_git::{parse_negotiation, Negotiation, ServiceKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for kind in [ServiceKind::UploadPack, ServiceKind::ReceivePack] {
        for record in parse_negotiation(kind, data) {
            assert!(!record.commit().is_empty());
            if let Negotiation::Push(update) = record {
                assert!(update.reference.starts_with("refs/"));
            }
        }
    }
});
