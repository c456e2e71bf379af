//! Orderings over records.
//!
//! Every order here ends in the default order and then the identity, so
//! sorting is deterministic even when two records agree on rank, title
//! and URL.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::models::Record;

pub trait RankOrder: Send + Sync {
    /// Distinguishes cached group tops computed under different orders.
    fn name(&self) -> &'static str;

    fn compare(&self, a: &Record, b: &Record) -> Ordering;
}

/// Resolved before unresolved, then rank ascending (the service ranks the
/// most relevant result lowest), then title, then URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOrder;

impl RankOrder for DefaultOrder {
    fn name(&self) -> &'static str {
        "default"
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        match (a.metadata(), b.metadata()) {
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (Some(left), Some(right)) => {
                let by_rank = left.rank.total_cmp(&right.rank);
                if by_rank != Ordering::Equal {
                    return by_rank;
                }
            }
            (None, None) => {}
        }

        a.title()
            .unwrap_or_default()
            .cmp(b.title().unwrap_or_default())
            .then_with(|| a.url().cmp(b.url()))
            .then_with(|| a.identity().cmp(b.identity()))
    }
}

/// Favorite sites first, then nearest first. Records without a distance
/// estimate sort after those with one.
#[derive(Debug, Clone, Default)]
pub struct RelevanceOrder {
    favorites: HashSet<String>,
}

impl RelevanceOrder {
    pub fn new(favorites: impl IntoIterator<Item = String>) -> Self {
        Self {
            favorites: favorites.into_iter().collect(),
        }
    }

    pub fn is_favorite(&self, record: &Record) -> bool {
        let site = record
            .metadata()
            .map(|meta| meta.site_url.as_str())
            .unwrap_or(record.url());
        self.favorites.contains(site)
    }
}

impl RankOrder for RelevanceOrder {
    fn name(&self) -> &'static str {
        "relevance"
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.is_favorite(b)
            .cmp(&self.is_favorite(a))
            .then_with(|| DistanceOrder.compare_distance(a, b))
            .then_with(|| DefaultOrder.compare(a, b))
    }
}

/// Nearest first by smoothed distance estimate.
///
/// This is only an ordering; records are still updated by their latest
/// sighting regardless of which device is nearer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistanceOrder;

impl DistanceOrder {
    fn compare_distance(&self, a: &Record, b: &Record) -> Ordering {
        match (a.distance_m(), b.distance_m()) {
            (Some(left), Some(right)) => left.total_cmp(&right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl RankOrder for DistanceOrder {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.compare_distance(a, b)
            .then_with(|| DefaultOrder.compare(a, b))
    }
}

pub fn sort_records(records: &mut [Record], order: &dyn RankOrder) {
    records.sort_by(|a, b| order.compare(a, b));
}
