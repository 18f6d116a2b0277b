//! Pull pagination planning.
//!
//! A [`PullPlan`] turns one logical pull into a sequence of page queries.
//! The planner is pure: the engine asks for the next query, fetches the
//! page, and feeds the rows back through [`PullPlan::advance`], which
//! decides whether to stop and whether the incremental delta token moved.
//!
//! Incremental pulls order by the server-maintained `updatedAt` column
//! and window with `updatedAt >= token`. Because the window is
//! inclusive, rows at the token timestamp are re-fetched; the planner
//! compensates by skipping exactly the rows already seen at that
//! timestamp. When a whole page shares one timestamp the token cannot
//! move and the planner falls back to widening the skip, which still
//! guarantees progress.

use serde_json::Value;
use tablesync_types::{compare_values, sys, Filter, Query, SortOrder};

/// What to do after applying a fetched page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// The pull is complete; no further pages.
    Done,
    /// Fetch another page. When `delta_token` is set, the incremental
    /// watermark advanced and should be persisted before continuing.
    Continue {
        /// The new delta token, if it moved.
        delta_token: Option<Value>,
    },
}

/// Pagination state for one pull.
#[derive(Debug, Clone)]
pub struct PullPlan {
    base: Query,
    page_size: u32,
    skip: u64,
    delta_token: Option<Value>,
    incremental: bool,
}

impl PullPlan {
    /// Plan a plain (non-incremental) pull: page through the query with
    /// skip/top until an empty page comes back.
    pub fn plain(query: Query, page_size: u32) -> Self {
        Self {
            base: query,
            page_size,
            skip: 0,
            delta_token: None,
            incremental: false,
        }
    }

    /// Plan an incremental pull resuming from `token` (the highest
    /// `updatedAt` seen by previous pulls, or `None` for a first pull).
    pub fn incremental(query: Query, page_size: u32, token: Option<Value>) -> Self {
        Self {
            base: query,
            page_size,
            skip: 0,
            delta_token: token,
            incremental: true,
        }
    }

    /// The current delta token.
    pub fn delta_token(&self) -> Option<&Value> {
        self.delta_token.as_ref()
    }

    /// The query for the next page.
    pub fn next_query(&self) -> Query {
        let mut query = self.base.clone();
        if self.incremental {
            if let Some(token) = &self.delta_token {
                query = query.and_filter(Filter::Ge(sys::UPDATED_AT.into(), token.clone()));
            }
            query = query.order_by(sys::UPDATED_AT, SortOrder::Ascending);
        }
        query
            .with_skip(self.base.skip().unwrap_or(0) + self.skip)
            .with_top(u64::from(self.page_size))
    }

    /// Account for a fetched page and decide whether to continue.
    pub fn advance(&mut self, page: &[Value]) -> PageOutcome {
        if page.is_empty() {
            return PageOutcome::Done;
        }
        if !self.incremental {
            self.skip += page.len() as u64;
            return PageOutcome::Continue { delta_token: None };
        }

        let max = page
            .iter()
            .filter_map(|row| row.get(sys::UPDATED_AT))
            .fold(None::<Value>, |max, v| match &max {
                Some(m) if compare_values(v, m) != Some(std::cmp::Ordering::Greater) => max,
                _ => Some(v.clone()),
            });

        match max {
            Some(max) if self.delta_token.as_ref() != Some(&max) => {
                // Token moved: the next window re-fetches rows at the new
                // timestamp, so skip the ones this page already delivered.
                self.skip = page
                    .iter()
                    .filter(|row| row.get(sys::UPDATED_AT) == Some(&max))
                    .count() as u64;
                self.delta_token = Some(max.clone());
                PageOutcome::Continue {
                    delta_token: Some(max),
                }
            }
            _ => {
                // Every row shares the token timestamp (or lacks one);
                // keep paging inside the same window.
                self.skip += page.len() as u64;
                PageOutcome::Continue { delta_token: None }
            }
        }
    }
}
