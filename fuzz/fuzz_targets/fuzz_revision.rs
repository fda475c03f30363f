// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for revision parsing.
//!
//! Parsing never panics, and anything that parses prints back to the
//! same string and parses to the same revision.

#![no_main]

use libfuzzer_sys::fuzz_target;
use revsync::Revision;

fuzz_target!(|data: &str| {
    let Ok(rev) = data.parse::<Revision>() else {
        return;
    };

    assert!(rev.generation >= 1);
    assert_eq!(rev.to_string(), data);

    let again: Revision = rev.to_string().parse().expect("display output parses");
    assert_eq!(again, rev);
});
