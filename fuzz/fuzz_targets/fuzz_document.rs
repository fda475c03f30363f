// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for documents arriving over the wire.
//!
//! Decoding, validation and history expansion must reject bad input with
//! an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use revsync::Document;

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = serde_json::from_slice::<Document>(data) else {
        return;
    };

    let _ = doc.validate();

    if let Ok(history) = doc.history() {
        // Leaf first, one generation per step.
        assert!(!history.is_empty());
        assert_eq!(Some(&history[0]), doc.rev.as_ref());
        for pair in history.windows(2) {
            assert_eq!(pair[0].generation, pair[1].generation + 1);
        }
    }
});
