//! Paged feed protocol
//!
//! A feed page looks like `{"data": [...], "paging": {"is_end": bool, "next": url}}`.
//! The `next` URL is opaque; the continuation is recovered from its query
//! string by an ordered list of strategies, falling back to an offset bump.

use crate::credentials::CredentialBundle;
use crate::{HarvestError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

/// Position within a paged feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingState {
    pub cursor: Option<String>,
    pub offset: u64,
    /// Number of pages already consumed
    pub page_index: u32,
}

/// Which feed to fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRequest {
    /// Keyword search used for discovery
    Search {
        keywords: String,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    },
    /// Answers of one parent
    Children { parent_id: String },
}

/// One page of a feed together with where to continue
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub items: Vec<Value>,
    pub next: PagingState,
    pub is_end: bool,
    pub totals: Option<u64>,
}

/// Anything that can serve pages of a feed
///
/// One call is one unit of work: the caller owns delays between calls and
/// decides what to do with auth failures.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(
        &self,
        request: &FeedRequest,
        state: &PagingState,
        credential: &CredentialBundle,
    ) -> Result<FetchedPage>;
}

#[derive(Debug, Deserialize)]
struct RawPage {
    data: Vec<Value>,
    #[serde(default)]
    paging: Option<RawPaging>,
}

#[derive(Debug, Deserialize)]
struct RawPaging {
    #[serde(default)]
    is_end: Option<bool>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    totals: Option<u64>,
}

/// Parses a page body and resolves its continuation
///
/// An empty body, invalid JSON or a missing `data` array is a malformed page.
/// A missing `paging` block means the feed has ended.
pub fn parse_page(
    url: &str,
    body: &str,
    current: &PagingState,
    page_size: u32,
) -> Result<FetchedPage> {
    if body.trim().is_empty() {
        return Err(HarvestError::MalformedPage {
            url: url.to_string(),
            message: "empty body".to_string(),
        });
    }

    let raw: RawPage = serde_json::from_str(body).map_err(|e| HarvestError::MalformedPage {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let (is_end, next_url, totals) = match raw.paging {
        Some(paging) => (paging.is_end.unwrap_or(true), paging.next, paging.totals),
        None => (true, None, None),
    };

    let next = resolve_next_state(current, next_url.as_deref(), raw.data.len(), page_size);

    Ok(FetchedPage {
        items: raw.data,
        next,
        is_end,
        totals,
    })
}

type NextParams = HashMap<String, String>;
type ContinuationStrategy = fn(&NextParams, &PagingState, usize) -> Option<PagingState>;

/// Tried in order; the first strategy returning Some wins
const CONTINUATION_STRATEGIES: &[(&str, ContinuationStrategy)] = &[
    ("cursor", continue_from_cursor),
    ("offset", continue_from_offset),
    ("limit", continue_from_limit),
];

fn continue_from_cursor(
    params: &NextParams,
    current: &PagingState,
    item_count: usize,
) -> Option<PagingState> {
    let cursor = params.get("cursor").filter(|c| !c.is_empty())?;
    let offset = params
        .get("offset")
        .and_then(|o| o.parse().ok())
        .unwrap_or(current.offset + item_count as u64);
    Some(PagingState {
        cursor: Some(cursor.clone()),
        offset,
        page_index: current.page_index + 1,
    })
}

fn continue_from_offset(
    params: &NextParams,
    current: &PagingState,
    _item_count: usize,
) -> Option<PagingState> {
    let offset = params.get("offset")?.parse().ok()?;
    Some(PagingState {
        cursor: None,
        offset,
        page_index: current.page_index + 1,
    })
}

fn continue_from_limit(
    params: &NextParams,
    current: &PagingState,
    _item_count: usize,
) -> Option<PagingState> {
    let limit: u64 = params.get("limit")?.parse().ok()?;
    Some(PagingState {
        cursor: None,
        offset: current.offset + limit,
        page_index: current.page_index + 1,
    })
}

/// Works out the paging state for the page after `current`
///
/// Never fails: an absent or unparseable `next` URL degrades to advancing the
/// offset by the number of items received, or by `page_size` when the page
/// was empty.
pub fn resolve_next_state(
    current: &PagingState,
    next_url: Option<&str>,
    item_count: usize,
    page_size: u32,
) -> PagingState {
    if let Some(raw) = next_url.filter(|u| !u.is_empty()) {
        match Url::parse(raw) {
            Ok(url) => {
                let params: NextParams = url.query_pairs().into_owned().collect();
                for (name, strategy) in CONTINUATION_STRATEGIES {
                    if let Some(state) = strategy(&params, current, item_count) {
                        tracing::trace!(strategy = name, offset = state.offset, "Resolved next page");
                        return state;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(next = raw, error = %e, "Unparseable next URL, falling back to offset");
            }
        }
    }

    let step = if item_count > 0 {
        item_count as u64
    } else {
        page_size as u64
    };
    PagingState {
        cursor: None,
        offset: current.offset + step,
        page_index: current.page_index + 1,
    }
}

/// Why a page walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfFeed,
    TargetReached,
    PageCeiling,
}

/// Termination bookkeeping for one walk over a feed
#[derive(Debug, Clone)]
pub struct PageWalk {
    max_pages: u32,
    item_target: Option<u64>,
    items_seen: u64,
}

impl PageWalk {
    pub fn new(max_pages: u32, item_target: Option<u64>) -> Self {
        Self {
            max_pages,
            item_target,
            items_seen: 0,
        }
    }

    /// How many items of the next page may still be kept
    pub fn allowance(&self, available: usize) -> usize {
        match self.item_target {
            Some(target) => available.min(target.saturating_sub(self.items_seen) as usize),
            None => available,
        }
    }

    /// Records `kept` items of `page`; returns Some when the walk must stop
    ///
    /// The page ceiling is judged on `page.next.page_index`, so a walk
    /// resumed from a checkpoint keeps counting where it left off.
    pub fn advance(&mut self, page: &FetchedPage, kept: usize) -> Option<StopReason> {
        self.items_seen += kept as u64;

        if page.is_end {
            return Some(StopReason::EndOfFeed);
        }
        if self.item_target.is_some_and(|target| self.items_seen >= target) {
            return Some(StopReason::TargetReached);
        }
        if page.next.page_index >= self.max_pages {
            tracing::warn!(
                pages = page.next.page_index,
                max_pages = self.max_pages,
                "Page ceiling reached before end of feed"
            );
            return Some(StopReason::PageCeiling);
        }
        None
    }

    pub fn items_seen(&self) -> u64 {
        self.items_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A feed of `total` items served `per_page` at a time
    struct SyntheticFeed {
        total: u64,
        per_page: u64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeedSource for SyntheticFeed {
        async fn fetch_page(
            &self,
            _request: &FeedRequest,
            state: &PagingState,
            _credential: &CredentialBundle,
        ) -> Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = state.offset;
            let end = (start + self.per_page).min(self.total);
            let items: Vec<Value> = (start..end).map(|i| json!({ "id": i })).collect();
            let body = json!({
                "data": items,
                "paging": {
                    "is_end": end >= self.total,
                    "next": format!("https://api.example.com/feeds?offset={}&limit={}", end, self.per_page),
                }
            });
            parse_page("https://api.example.com/feeds", &body.to_string(), state, 10)
        }
    }

    async fn walk_all(feed: &SyntheticFeed, walk: &mut PageWalk) -> Vec<Value> {
        let request = FeedRequest::Children {
            parent_id: "q1".to_string(),
        };
        let credential = CredentialBundle::new();
        let mut state = PagingState::default();
        let mut items = Vec::new();

        loop {
            let page = feed.fetch_page(&request, &state, &credential).await.unwrap();
            let kept = walk.allowance(page.items.len());
            items.extend(page.items.iter().take(kept).cloned());
            if walk.advance(&page, kept).is_some() {
                break;
            }
            state = page.next;
        }
        items
    }

    #[tokio::test]
    async fn test_walk_yields_all_items_then_stops() {
        for total in [1u64, 10, 37, 100] {
            let feed = SyntheticFeed {
                total,
                per_page: 10,
                calls: AtomicU32::new(0),
            };
            let mut walk = PageWalk::new(1000, None);
            let items = walk_all(&feed, &mut walk).await;

            assert_eq!(items.len() as u64, total);
            assert_eq!(feed.calls.load(Ordering::SeqCst) as u64, total.div_ceil(10));
        }
    }

    #[tokio::test]
    async fn test_walk_stops_at_item_target() {
        let feed = SyntheticFeed {
            total: 100,
            per_page: 10,
            calls: AtomicU32::new(0),
        };
        let mut walk = PageWalk::new(1000, Some(25));
        let items = walk_all(&feed, &mut walk).await;

        assert_eq!(items.len(), 25);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_page_ceiling_caps_endless_empty_feed() {
        let mut walk = PageWalk::new(3, None);
        let mut state = PagingState::default();
        let mut stop = None;

        while stop.is_none() {
            let page = parse_page(
                "https://api.example.com/feeds",
                r#"{"data": [], "paging": {"is_end": false}}"#,
                &state,
                20,
            )
            .unwrap();
            stop = walk.advance(&page, 0);
            state = page.next;
        }

        assert_eq!(stop, Some(StopReason::PageCeiling));
        assert_eq!(state.page_index, 3);
        assert_eq!(state.offset, 60);
    }

    #[test]
    fn test_cursor_strategy_wins() {
        let current = PagingState::default();
        let next = resolve_next_state(
            &current,
            Some("https://api.example.com/feeds?cursor=abc&offset=20&limit=20"),
            20,
            20,
        );
        assert_eq!(next.cursor.as_deref(), Some("abc"));
        assert_eq!(next.offset, 20);
        assert_eq!(next.page_index, 1);
    }

    #[test]
    fn test_offset_strategy() {
        let current = PagingState {
            cursor: None,
            offset: 20,
            page_index: 1,
        };
        let next = resolve_next_state(
            &current,
            Some("https://api.example.com/feeds?offset=40"),
            20,
            20,
        );
        assert_eq!(next.cursor, None);
        assert_eq!(next.offset, 40);
        assert_eq!(next.page_index, 2);
    }

    #[test]
    fn test_limit_strategy_when_offset_unparseable() {
        let current = PagingState {
            cursor: None,
            offset: 5,
            page_index: 0,
        };
        let next = resolve_next_state(
            &current,
            Some("https://api.example.com/feeds?offset=abc&limit=5"),
            3,
            20,
        );
        assert_eq!(next.offset, 10);
    }

    #[test]
    fn test_garbage_next_falls_back_to_item_count() {
        let current = PagingState::default();
        let next = resolve_next_state(&current, Some("::not a url::"), 7, 20);
        assert_eq!(next.offset, 7);
        assert_eq!(next.cursor, None);

        let next = resolve_next_state(&current, None, 0, 20);
        assert_eq!(next.offset, 20);
    }

    #[test]
    fn test_malformed_bodies() {
        let state = PagingState::default();
        for body in ["", "   ", "<html>oops</html>", r#"{"paging": {}}"#] {
            let err = parse_page("https://api.example.com/feeds", body, &state, 20).unwrap_err();
            assert!(matches!(err, HarvestError::MalformedPage { .. }), "{:?}", body);
        }
    }

    #[test]
    fn test_missing_paging_means_end() {
        let page = parse_page(
            "https://api.example.com/feeds",
            r#"{"data": [{"id": 1}]}"#,
            &PagingState::default(),
            20,
        )
        .unwrap();
        assert!(page.is_end);
        assert_eq!(page.items.len(), 1);
    }
}
