//! Browser-driven fallback surface
//!
//! Automation itself lives outside this crate. The orchestrator only needs a
//! page it can open, scroll and read items from.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// A scriptable page
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Scrolls to the bottom so lazily loaded items render
    async fn scroll(&self) -> Result<()>;

    /// Returns every item currently rendered, in page order
    async fn extract_items(&self) -> Result<Vec<Value>>;
}

/// Scroll limits for one lazy-loaded page
#[derive(Debug, Clone, Copy)]
pub struct ScrollPlan {
    pub max_scrolls: u32,
    /// Consecutive scrolls without new items before giving up
    pub max_idle_scrolls: u32,
}

impl Default for ScrollPlan {
    fn default() -> Self {
        Self {
            max_scrolls: 20,
            max_idle_scrolls: 3,
        }
    }
}

fn item_key(item: &Value) -> String {
    item.get("object")
        .or_else(|| item.get("target"))
        .unwrap_or(item)
        .get("id")
        .map(Value::to_string)
        .unwrap_or_else(|| item.to_string())
}

/// Opens `url` and scrolls until no new items appear
///
/// Items are deduplicated by id and returned in first-seen order.
pub async fn collect_items(
    surface: &dyn BrowserSurface,
    url: &str,
    plan: ScrollPlan,
    cancel: &CancellationToken,
) -> Result<Vec<Value>> {
    surface.navigate(url).await?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    let mut idle = 0;

    for scroll in 0..=plan.max_scrolls {
        let before = items.len();
        for item in surface.extract_items().await? {
            if seen.insert(item_key(&item)) {
                items.push(item);
            }
        }

        if items.len() == before {
            idle += 1;
            if idle >= plan.max_idle_scrolls {
                tracing::debug!(scroll, items = items.len(), "No new items after scrolling");
                break;
            }
        } else {
            idle = 0;
        }

        if scroll == plan.max_scrolls || cancel.is_cancelled() {
            break;
        }
        surface.scroll().await?;
    }

    tracing::info!(url, items = items.len(), "Collected items through browser surface");
    Ok(items)
}
