// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for revision tree merging.
//!
//! Arbitrary revision paths are merged into one tree. Merges may fail, but
//! the tree must always have a winner among its leaves once it is non-empty.

#![no_main]

use libfuzzer_sys::fuzz_target;
use revsync::document::Fields;
use revsync::{RevTree, Revision};

fuzz_target!(|paths: Vec<Vec<(u8, u8)>>| {
    let mut tree = RevTree::new("fuzz");

    for raw in paths.iter().take(16) {
        let path: Vec<Revision> = raw
            .iter()
            .take(8)
            .map(|(generation, hash)| Revision::new(u64::from(*generation).max(1), format!("{:02x}", hash)))
            .collect();
        let _ = tree.merge_path(&path, false, Fields::new());
    }

    if tree.is_empty() {
        return;
    }

    let winner = tree.winner().map(|n| n.rev.clone()).expect("non-empty tree has a winner");
    let leaves = tree.leaf_revs();
    assert!(leaves.contains(&winner));
    assert!(leaves.iter().all(|leaf| leaf <= &winner));
});
