//! # Canonical Ordering
//!
//! The one total order used for every tie-break in the engine: choosing the
//! canonical id of a component, orienting edges, and picking the surviving id
//! of a merge.
//!
//! Identifiers are compared byte-wise on their UTF-8 encoding. For the hashed
//! and opaque identifiers this engine handles that is plain lexicographic
//! order; numeric-looking ids only sort numerically when they share a width
//! (zero-padded encodings), which is how upstream device ids are issued.

use std::cmp::Ordering;

/// Compare two identifier values under the canonical order.
#[inline]
pub fn canonical_cmp(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// Order a pair so that the smaller value comes first.
#[inline]
pub fn ordered_pair<T: AsRef<str>>(a: T, b: T) -> (T, T) {
    if canonical_cmp(a.as_ref(), b.as_ref()) == Ordering::Greater {
        (b, a)
    } else {
        (a, b)
    }
}
