//! String interning (spec.md §3 "String", §4.1.3 "For strings, remove the
//! entry from the intern table before freeing"). Grounded on
//! `gc/string_interner.rs` in the teacher, adapted from pointer buckets to
//! index buckets.

use ahash::RandomState;
use std::collections::HashMap;

/// Maps a string's FNV-1a hash to the arena indices of every live interned
/// string with that hash (a `Vec` to tolerate collisions).
#[derive(Default)]
pub struct StringInterner {
    buckets: HashMap<u32, Vec<u32>, RandomState>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner {
            buckets: HashMap::default(),
        }
    }

    /// Look up an already-interned string by content hash; the caller
    /// compares bytes against each candidate index (content equality still
    /// has to be checked because of hash collisions).
    pub fn candidates(&self, hash: u32) -> &[u32] {
        self.buckets.get(&hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn insert(&mut self, hash: u32, idx: u32) {
        self.buckets.entry(hash).or_default().push(idx);
    }

    /// Drop the record for a string about to be swept (spec.md §4.1.3).
    pub fn remove(&mut self, hash: u32, idx: u32) {
        if let Some(v) = self.buckets.get_mut(&hash) {
            v.retain(|&i| i != idx);
            if v.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }
}
