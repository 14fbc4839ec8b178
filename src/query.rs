// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter, sort and pagination contract shared by the remote ledger and the
//! local cache, so offline reads answer exactly like online ones.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::model::{RedemptionOption, RedemptionTransaction, TransactionStatus};

/// Catalog filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionFilter {
    #[serde(default)]
    pub category: Option<String>,
    /// Only options redeemable right now (active and not expired)
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub max_cost: Option<i64>,
    /// Case-insensitive match on title or description
    #[serde(default)]
    pub search: Option<String>,
}

impl OptionFilter {
    #[must_use]
    pub fn redeemable() -> Self {
        Self { active_only: true, ..Default::default() }
    }

    #[must_use]
    pub fn matches(&self, option: &RedemptionOption, now: i64) -> bool {
        if let Some(ref category) = self.category {
            if !option.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if self.active_only && !option.is_redeemable(now) {
            return false;
        }
        if let Some(max) = self.max_cost {
            if option.points_cost > max {
                return false;
            }
        }
        if let Some(ref needle) = self.search {
            let needle = needle.to_lowercase();
            if !option.title.to_lowercase().contains(&needle)
                && !option.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionSort {
    #[default]
    CostAsc,
    CostDesc,
    Newest,
    Title,
}

impl OptionSort {
    pub fn sort(&self, options: &mut [RedemptionOption]) {
        match self {
            Self::CostAsc => options.sort_by(|a, b| a.points_cost.cmp(&b.points_cost).then(a.id.cmp(&b.id))),
            Self::CostDesc => options.sort_by(|a, b| b.points_cost.cmp(&a.points_cost).then(a.id.cmp(&b.id))),
            Self::Newest => options.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id))),
            Self::Title => options.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id))),
        }
    }
}

/// Redemption history filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Empty means every status
    #[serde(default)]
    pub statuses: Vec<TransactionStatus>,
    #[serde(default)]
    pub option_id: Option<String>,
    /// Inclusive lower bound on `redeemed_at`
    #[serde(default)]
    pub since: Option<i64>,
    /// Exclusive upper bound on `redeemed_at`
    #[serde(default)]
    pub until: Option<i64>,
}

impl TransactionFilter {
    #[must_use]
    pub fn with_statuses(statuses: &[TransactionStatus]) -> Self {
        Self { statuses: statuses.to_vec(), ..Default::default() }
    }

    #[must_use]
    pub fn matches(&self, tx: &RedemptionTransaction) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&tx.status) {
            return false;
        }
        if let Some(ref option_id) = self.option_id {
            if &tx.option_id != option_id {
                return false;
            }
        }
        if self.since.is_some_and(|since| tx.redeemed_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| tx.redeemed_at >= until) {
            return false;
        }
        true
    }
}

/// Most recent first, id as tiebreak so pages are stable.
pub fn sort_by_recency(txs: &mut [RedemptionTransaction]) {
    txs.sort_by(|a, b| b.redeemed_at.cmp(&a.redeemed_at).then(b.id.cmp(&a.id)));
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Result<Self, LedgerError> {
        if page == 0 {
            return Err(LedgerError::Validation("page numbers start at 1".into()));
        }
        if limit == 0 || limit > Self::MAX_LIMIT {
            return Err(LedgerError::Validation(format!(
                "page limit must be within 1..={}",
                Self::MAX_LIMIT
            )));
        }
        Ok(Self { page, limit })
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub has_more: bool,
}

impl<T> PaginatedResult<T> {
    /// Slice an already filtered and sorted list.
    pub fn from_sorted(all: Vec<T>, page: PageRequest) -> Self {
        let total = all.len() as u64;
        let offset = page.offset();
        let items: Vec<T> = all.into_iter().skip(offset).take(page.limit as usize).collect();
        let has_more = (offset + items.len()) < total as usize;
        Self { items, page: page.page, limit: page.limit, total, has_more }
    }

    pub fn empty(page: PageRequest) -> Self {
        Self { items: Vec::new(), page: page.page, limit: page.limit, total: 0, has_more: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RedeemRequest;

    fn tx(id: &str, redeemed_at: i64, status: TransactionStatus) -> RedemptionTransaction {
        let mut tx = RedemptionTransaction::local_pending(&RedeemRequest::new("u", "opt", 10, None), "t");
        tx.id = id.into();
        tx.redeemed_at = redeemed_at;
        tx.status = status;
        tx
    }

    #[test]
    fn test_option_filter() {
        let now = 10_000;
        let coffee = RedemptionOption::new("a", "Coffee", 50).with_category("food");
        let movie = RedemptionOption::new("b", "Movie", 300).with_category("fun").with_description("Cinema ticket");
        let expired = RedemptionOption::new("c", "Old", 10).with_expiry(5_000);

        assert!(OptionFilter::default().matches(&expired, now));
        assert!(!OptionFilter::redeemable().matches(&expired, now));

        let food = OptionFilter { category: Some("FOOD".into()), ..Default::default() };
        assert!(food.matches(&coffee, now));
        assert!(!food.matches(&movie, now));

        let cheap = OptionFilter { max_cost: Some(100), ..Default::default() };
        assert!(cheap.matches(&coffee, now));
        assert!(!cheap.matches(&movie, now));

        let search = OptionFilter { search: Some("cinema".into()), ..Default::default() };
        assert!(search.matches(&movie, now));
        assert!(!search.matches(&coffee, now));
    }

    #[test]
    fn test_option_sorts() {
        let mut options = vec![
            RedemptionOption::new("a", "Zoo", 300),
            RedemptionOption::new("b", "Art", 100),
            RedemptionOption::new("c", "Mall", 200),
        ];
        OptionSort::CostAsc.sort(&mut options);
        assert_eq!(options.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["b", "c", "a"]);
        OptionSort::CostDesc.sort(&mut options);
        assert_eq!(options.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["a", "c", "b"]);
        OptionSort::Title.sort(&mut options);
        assert_eq!(options.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["b", "c", "a"]);
    }

    #[test]
    fn test_transaction_filter_bounds() {
        let filter = TransactionFilter { since: Some(100), until: Some(200), ..Default::default() };
        assert!(!filter.matches(&tx("a", 99, TransactionStatus::Completed)));
        assert!(filter.matches(&tx("b", 100, TransactionStatus::Completed)));
        assert!(!filter.matches(&tx("c", 200, TransactionStatus::Completed)));

        let pending = TransactionFilter::with_statuses(&[TransactionStatus::Pending]);
        assert!(pending.matches(&tx("d", 1, TransactionStatus::Pending)));
        assert!(!pending.matches(&tx("e", 1, TransactionStatus::Cancelled)));
    }

    #[test]
    fn test_recency_sort() {
        let mut txs = vec![tx("a", 1, TransactionStatus::Pending), tx("b", 3, TransactionStatus::Pending), tx("c", 2, TransactionStatus::Pending)];
        sort_by_recency(&mut txs);
        assert_eq!(txs.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["b", "c", "a"]);
    }

    #[test]
    fn test_page_request_validation() {
        assert!(PageRequest::new(0, 10).is_err());
        assert!(PageRequest::new(1, 0).is_err());
        assert!(PageRequest::new(1, 101).is_err());
        assert_eq!(PageRequest::new(3, 10).unwrap().offset(), 20);
    }

    #[test]
    fn test_pagination() {
        let all: Vec<u32> = (0..25).collect();
        let first = PaginatedResult::from_sorted(all.clone(), PageRequest::new(1, 10).unwrap());
        assert_eq!(first.items, (0..10).collect::<Vec<_>>());
        assert!(first.has_more);
        assert_eq!(first.total, 25);

        let last = PaginatedResult::from_sorted(all.clone(), PageRequest::new(3, 10).unwrap());
        assert_eq!(last.items, (20..25).collect::<Vec<_>>());
        assert!(!last.has_more);

        let beyond = PaginatedResult::from_sorted(all, PageRequest::new(9, 10).unwrap());
        assert!(beyond.items.is_empty());
        assert!(!beyond.has_more);
    }
}
