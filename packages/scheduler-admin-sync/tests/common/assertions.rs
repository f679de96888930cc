//! Custom assertions for search results

use scheduler_admin_sync::SearchResult;

/// Ids of a result page, in stream order
pub fn ids(result: &SearchResult) -> Vec<&str> {
    result.schedules.iter().map(|r| r.id.as_str()).collect()
}

/// Assert the page holds exactly `expected`, in order.
pub fn assert_ids(result: &SearchResult, expected: &[&str]) {
    assert_eq!(
        ids(result),
        expected,
        "unexpected page (found={})",
        result.found
    );
}

/// Assert `found` and the streamed page size.
pub fn assert_page(result: &SearchResult, found: usize, streamed: usize) {
    assert_eq!(result.found, found, "found");
    assert_eq!(result.schedules.len(), streamed, "streamed");
}
