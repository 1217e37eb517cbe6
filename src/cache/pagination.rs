//! Page-count reconciliation.
//!
//! Page counts are always derived from the found count that is valid for the
//! current request, whether that count came from the cache or the engine.

use super::store::FoundCount;

/// `ceil(found / page_size)`, or `None` for unlimited (`page_size <= 0`)
/// queries, whose pagination metadata is left alone.
pub fn max_pages(found: u64, page_size: i64) -> Option<u64> {
    let page_size = u64::try_from(page_size).ok().filter(|size| *size > 0)?;
    Some(found.div_ceil(page_size))
}

/// Recompute `max_pages` in place from `found`.
///
/// Queries that did not track a found count are skipped entirely.
pub fn reconcile(found: FoundCount, page_size: i64, max_pages_slot: &mut Option<u64>) {
    let FoundCount::Counted(found) = found else {
        return;
    };
    if let Some(pages) = max_pages(found, page_size) {
        *max_pages_slot = Some(pages);
    }
}
