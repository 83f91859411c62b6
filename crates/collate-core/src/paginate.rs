//! # Paginator
//!
//! Slices an ordered collection into the window a [`PageSpec`] asks for.
//! Out-of-range windows are empty, never an error.

use crate::spec::PageSpec;
use serde::Serialize;
use std::ops::Range;

/// One window of an ordered collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of items before slicing.
    pub total_matched: usize,
    /// Whether items remain after this window.
    pub has_more: bool,
}

impl<T: Clone> Page<&T> {
    pub fn cloned(self) -> Page<T> {
        Page {
            items: self.items.into_iter().cloned().collect(),
            total_matched: self.total_matched,
            has_more: self.has_more,
        }
    }
}

impl PageSpec {
    /// Index range selected out of `total` items.
    ///
    /// Always satisfies `start <= end <= total`; arithmetic saturates so a
    /// huge index yields an empty window rather than overflowing.
    #[inline]
    pub fn window(&self, total: usize) -> Range<usize> {
        match *self {
            PageSpec::Indexed { index, size } => {
                let start = index.saturating_mul(size).min(total);
                let end = start.saturating_add(size).min(total);
                start..end
            }
            PageSpec::Reveal { visible_count } => 0..visible_count.min(total),
        }
    }
}

/// Cut `items` down to the requested window.
pub fn paginate<T: Clone>(items: &[T], page: &PageSpec) -> Page<T> {
    let total = items.len();
    let window = page.window(total);
    Page {
        has_more: window.end < total,
        items: items[window].to_vec(),
        total_matched: total,
    }
}

// =============================================================================
// Kani Proofs: Window Bounds
// =============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// **Proof: an indexed window never escapes the collection**
    #[kani::proof]
    fn verify_indexed_window_in_bounds() {
        let index: usize = kani::any();
        let size: usize = kani::any();
        let total: usize = kani::any();
        kani::assume(size > 0);

        let w = PageSpec::Indexed { index, size }.window(total);
        assert!(w.start <= w.end);
        assert!(w.end <= total);
        assert!(w.end - w.start <= size);
    }

    /// **Proof: reveal windows start at zero and are clamped**
    #[kani::proof]
    fn verify_reveal_window_clamped() {
        let visible_count: usize = kani::any();
        let total: usize = kani::any();

        let w = PageSpec::Reveal { visible_count }.window(total);
        assert!(w.start == 0);
        assert!(w.end <= total);
        assert!(w.end <= visible_count);
    }
}
