use std::fmt::Display;

use base64::{Engine, engine::general_purpose::STANDARD};
use log::warn;
use serde::Serialize;

/// The maximum number of items the search API returns in one page.
pub const MAX_PAGE_SIZE: u16 = 100;

/// The maximum number of items the search API returns for one query, across all pages.
pub const MAX_SEARCH_RESULTS: u32 = 1000;

/// Computes the positional search cursor pointing right before the item at `offset`.
pub fn offset_cursor(offset: u32) -> Option<String> {
    (offset > 0).then(|| STANDARD.encode(format!("cursor:{offset}")))
}

/// A request for one page of search results
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Hash)]
pub struct SearchPageRequest {
    /// The text query.
    pub(crate) query: String,

    /// The number of repositories to return.
    pub(crate) first: u16,

    /// The cursor for pagination.
    pub(crate) after: Option<String>,
}

impl SearchPageRequest {
    /// Creates a new `SearchPageRequest` with the given query, first, and after values.
    pub fn new(query: &str, first: u16, after: Option<String>) -> Self {
        Self {
            query: query.to_string(),
            first: first.min(MAX_PAGE_SIZE),
            after,
        }
    }

    /// The number of items requested.
    pub fn first(&self) -> u16 {
        self.first
    }

    /// Creates a dummy `SearchPageRequest` for testing purposes.
    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        Self::new("dummy", 10, None)
    }
}

impl Display for SearchPageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SearchPageRequest: query={}, first={}, after={:?}",
            self.query, self.first, self.after
        )
    }
}

/// The lifecycle of a batch during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Pending,
    Fetching,
    Succeeded,
    Writing,
    Committed,
    Failed,
    /// Never completed because the run was cancelled
    Skipped,
}

impl BatchState {
    /// Whether the batch reached the end of its lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Committed | BatchState::Failed | BatchState::Skipped
        )
    }
}

impl Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A bounded slice of the crawl: `size` consecutive results of one search query, starting at
/// `offset`.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Hash)]
pub struct BatchSpec {
    /// Position of the batch in the dispatch order.
    pub(crate) index: usize,

    /// The search query (partition) this batch belongs to.
    pub(crate) query: String,

    /// Offset of the first result in the query.
    pub(crate) offset: u32,

    /// Number of results of the batch.
    pub(crate) size: u16,

    /// Number of results per upstream page.
    pub(crate) page_size: u16,
}

impl BatchSpec {
    /// Creates a new `BatchSpec`.
    pub fn new(index: usize, query: &str, offset: u32, size: u16, page_size: u16) -> Self {
        Self {
            index,
            query: query.to_string(),
            offset,
            size,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Retrieves the batch index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Retrieves the search query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Retrieves the offset of the batch in its query.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Retrieves the batch size.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// The request for the first page of the batch.
    pub fn first_page_request(&self) -> SearchPageRequest {
        SearchPageRequest::new(
            &self.query,
            self.page_size.min(self.size),
            offset_cursor(self.offset),
        )
    }

    /// The request following `fetched` already fetched results, or `None` if the batch is full.
    pub fn next_page_request(
        &self,
        fetched: usize,
        end_cursor: Option<String>,
    ) -> Option<SearchPageRequest> {
        let remaining = (self.size as usize).checked_sub(fetched)?;
        if remaining == 0 {
            return None;
        }
        let after = end_cursor.or_else(|| offset_cursor(self.offset + fetched as u32));

        Some(SearchPageRequest::new(
            &self.query,
            self.page_size.min(remaining as u16),
            after,
        ))
    }

    /// Creates a dummy `BatchSpec` for testing purposes.
    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        Self::new(0, "dummy", 0, 10, 10)
    }
}

impl Display for BatchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batch #{}: query={}, offset={}, size={}",
            self.index, self.query, self.offset, self.size
        )
    }
}

/// Builds the default search partitions: one exact star-count band per 1000 requested
/// repositories, since the search API never returns more than 1000 results per query.
pub fn star_partitions(base_query: &str, min_stars: u32, total_requested: u32) -> Vec<String> {
    let base_query = base_query.trim();
    (0..total_requested.div_ceil(MAX_SEARCH_RESULTS))
        .map(|band| {
            let stars = min_stars + band;
            if base_query.is_empty() {
                format!("stars:{stars}")
            } else {
                format!("{base_query} stars:{stars}")
            }
        })
        .collect()
}

/// Splits `total_requested` results into ordered batches over the search partitions.
///
/// Each batch is at most `batch_size` results and never crosses the per-query ceiling of
/// [MAX_SEARCH_RESULTS].
pub fn plan_batches(
    total_requested: u32,
    batch_size: u16,
    page_size: u16,
    queries: &[String],
) -> Vec<BatchSpec> {
    let batch_size = batch_size.clamp(1, MAX_PAGE_SIZE) as u32;
    let page_size = page_size.clamp(1, batch_size as u16);
    let mut batches = Vec::new();
    let mut remaining = total_requested;

    for query in queries {
        let mut offset = 0;
        while remaining > 0 && offset < MAX_SEARCH_RESULTS {
            let size = batch_size.min(remaining).min(MAX_SEARCH_RESULTS - offset);
            batches.push(BatchSpec::new(
                batches.len(),
                query,
                offset,
                size as u16,
                page_size,
            ));
            offset += size;
            remaining -= size;
        }
        if remaining == 0 {
            break;
        }
    }
    if remaining > 0 {
        warn!(
            "Search partitions can not cover the request: {remaining}/{total_requested} repositories left unplanned"
        );
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_cursor_is_positional() {
        assert_eq!(None, offset_cursor(0));
        assert_eq!(Some("Y3Vyc29yOjEwMA==".to_string()), offset_cursor(100));
        assert_eq!(Some("Y3Vyc29yOjQw".to_string()), offset_cursor(40));
    }

    #[test]
    fn plan_splits_request_into_ordered_batches() {
        let queries = vec!["stars:1".to_string()];

        let batches = plan_batches(250, 100, 100, &queries);

        assert_eq!(
            vec![
                BatchSpec::new(0, "stars:1", 0, 100, 100),
                BatchSpec::new(1, "stars:1", 100, 100, 100),
                BatchSpec::new(2, "stars:1", 200, 50, 100),
            ],
            batches
        );
    }

    #[test]
    fn plan_never_crosses_the_search_ceiling() {
        let queries = vec!["stars:1".to_string(), "stars:2".to_string()];

        let batches = plan_batches(1500, 30, 30, &queries);

        assert_eq!(1500, batches.iter().map(|b| b.size as u32).sum::<u32>());
        for batch in &batches {
            assert!(batch.offset + batch.size as u32 <= MAX_SEARCH_RESULTS);
            assert!(batch.size <= 30);
        }
        let last_of_first_query = batches.iter().filter(|b| b.query == "stars:1").last().unwrap();
        assert_eq!(990, last_of_first_query.offset);
        assert_eq!(10, last_of_first_query.size);
        assert_eq!(
            (0..batches.len()).collect::<Vec<_>>(),
            batches.iter().map(|b| b.index).collect::<Vec<_>>()
        );
    }

    #[test]
    fn plan_is_shorter_when_partitions_are_exhausted() {
        let queries = vec!["stars:1".to_string()];

        let batches = plan_batches(1200, 100, 100, &queries);

        assert_eq!(10, batches.len());
        assert_eq!(1000, batches.iter().map(|b| b.size as u32).sum::<u32>());
    }

    #[test]
    fn plan_clamps_batch_size_to_page_ceiling() {
        let queries = vec!["stars:1".to_string()];

        let batches = plan_batches(300, 500, 500, &queries);

        assert_eq!(3, batches.len());
        assert!(batches.iter().all(|b| b.size == 100 && b.page_size == 100));
    }

    #[test]
    fn star_partitions_cover_the_request() {
        assert_eq!(
            vec!["is:public stars:1".to_string()],
            star_partitions("is:public", 1, 250)
        );
        assert_eq!(
            vec![
                "stars:5".to_string(),
                "stars:6".to_string(),
                "stars:7".to_string()
            ],
            star_partitions("", 5, 2001)
        );
    }

    #[test]
    fn batch_page_requests() {
        let batch = BatchSpec::new(3, "stars:1", 200, 50, 20);

        assert_eq!(
            SearchPageRequest::new("stars:1", 20, offset_cursor(200)),
            batch.first_page_request()
        );
        assert_eq!(
            Some(SearchPageRequest::new(
                "stars:1",
                20,
                Some("next".to_string())
            )),
            batch.next_page_request(20, Some("next".to_string()))
        );
        assert_eq!(
            Some(SearchPageRequest::new("stars:1", 10, offset_cursor(240))),
            batch.next_page_request(40, None)
        );
        assert_eq!(None, batch.next_page_request(50, None));
    }

    #[test]
    fn terminal_batch_states() {
        assert!(BatchState::Committed.is_terminal());
        assert!(BatchState::Failed.is_terminal());
        assert!(BatchState::Skipped.is_terminal());
        assert!(!BatchState::Writing.is_terminal());
    }
}
