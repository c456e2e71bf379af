use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use super::ranking::{sort_records, RelevanceOrder};
use crate::models::{Identity, Record};

pub const DEFAULT_FIRST_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_SECOND_WINDOW: Duration = Duration::from_secs(10);

const SHOWN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealWindows {
    /// The feed stays closed until this long after scan start.
    pub first: Duration,
    /// After this, new subscribers no longer restart the scan.
    pub second: Duration,
}

impl Default for RevealWindows {
    fn default() -> Self {
        Self {
            first: DEFAULT_FIRST_WINDOW,
            second: DEFAULT_SECOND_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RevealPhase {
    Closed,
    Open,
    Settled,
}

impl RevealPhase {
    pub fn at(elapsed: Duration, windows: RevealWindows) -> Self {
        if elapsed < windows.first {
            RevealPhase::Closed
        } else if elapsed < windows.second {
            RevealPhase::Open
        } else {
            RevealPhase::Settled
        }
    }
}

/// The synthetic entry shown above two individual entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSummary {
    /// Every visible entry, not just the two shown.
    pub total: usize,
    pub titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "camelCase")]
pub enum FeedLayout {
    Empty,
    Single {
        entry: Record,
    },
    Pair {
        summary: FeedSummary,
        first: Record,
        second: Record,
    },
}

impl FeedLayout {
    pub fn entries(&self) -> Vec<&Record> {
        match self {
            FeedLayout::Empty => Vec::new(),
            FeedLayout::Single { entry } => vec![entry],
            FeedLayout::Pair { first, second, .. } => vec![first, second],
        }
    }
}

/// Decides what the notification shows and when it needs redrawing.
pub struct NotificationFeed {
    order: RelevanceOrder,
    blocked_hosts: HashSet<String>,
    phase: RevealPhase,
    shown: BTreeSet<Identity>,
    layout: FeedLayout,
}

impl NotificationFeed {
    pub fn new(order: RelevanceOrder, blocked_hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            order,
            blocked_hosts: blocked_hosts
                .into_iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            phase: RevealPhase::Closed,
            shown: BTreeSet::new(),
            layout: FeedLayout::Empty,
        }
    }

    pub fn order(&self) -> &RelevanceOrder {
        &self.order
    }

    pub fn phase(&self) -> RevealPhase {
        self.phase
    }

    pub fn layout(&self) -> &FeedLayout {
        &self.layout
    }

    /// Back to closed for a new scan.
    pub fn reset(&mut self) {
        self.phase = RevealPhase::Closed;
        self.shown.clear();
        self.layout = FeedLayout::Empty;
    }

    /// Moves to `phase`. Opening always renders, even an empty feed.
    pub fn advance(&mut self, phase: RevealPhase, records: Vec<Record>) -> Option<FeedLayout> {
        let was_closed = self.phase == RevealPhase::Closed;
        self.phase = phase;
        if phase == RevealPhase::Closed {
            return None;
        }
        let rendered = self.update(records);
        if was_closed && rendered.is_none() {
            return Some(self.layout.clone());
        }
        rendered
    }

    /// Recomputes the top entries. Returns the new layout only when the set
    /// of shown entries changed; a reshuffle of the same entries is ignored.
    pub fn update(&mut self, mut records: Vec<Record>) -> Option<FeedLayout> {
        if self.phase == RevealPhase::Closed {
            return None;
        }

        records.retain(|record| record.metadata().is_some() && !self.is_blocked(record));
        sort_records(&mut records, &self.order);

        let top: BTreeSet<Identity> = records
            .iter()
            .take(SHOWN)
            .map(|record| record.identity().clone())
            .collect();
        if top == self.shown {
            return None;
        }

        self.layout = layout_for(&records);
        self.shown = top;
        Some(self.layout.clone())
    }

    pub fn is_blocked(&self, record: &Record) -> bool {
        if self.blocked_hosts.is_empty() {
            return false;
        }
        let site = record
            .metadata()
            .map(|meta| meta.site_url.as_str())
            .unwrap_or(record.url());
        Url::parse(site)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| self.blocked_hosts.contains(&host))
    }
}

fn layout_for(sorted: &[Record]) -> FeedLayout {
    match sorted {
        [] => FeedLayout::Empty,
        [only] => FeedLayout::Single {
            entry: only.clone(),
        },
        [first, second, ..] => FeedLayout::Pair {
            summary: FeedSummary {
                total: sorted.len(),
                titles: [first, second]
                    .iter()
                    .map(|record| record.title().unwrap_or(record.url()).to_string())
                    .collect(),
            },
            first: first.clone(),
            second: second.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResolvedMetadata, Sighting, TransportKind};

    fn record(url: &str, rank: f64) -> Record {
        let sighting = Sighting::builder(TransportKind::Ble, url).build();
        let mut record = Record::new(Identity::of(&sighting), sighting);
        record.metadata = Some(ResolvedMetadata {
            request_url: url.into(),
            site_url: url.into(),
            display_url: url.into(),
            title: Some(format!("{url} title")),
            description: None,
            icon_url: None,
            icon: None,
            rank,
            group_id: None,
            latency_ms: 0,
        });
        record
    }

    fn feed() -> NotificationFeed {
        NotificationFeed::new(RelevanceOrder::default(), Vec::new())
    }

    #[test]
    fn phases_follow_the_windows() {
        let windows = RevealWindows::default();
        assert_eq!(RevealPhase::at(Duration::from_millis(1999), windows), RevealPhase::Closed);
        assert_eq!(RevealPhase::at(Duration::from_secs(2), windows), RevealPhase::Open);
        assert_eq!(RevealPhase::at(Duration::from_secs(10), windows), RevealPhase::Settled);
    }

    #[test]
    fn closed_feed_renders_nothing_until_opened() {
        let mut feed = feed();
        assert_eq!(feed.update(vec![record("http://a.com", 0.1)]), None);

        let opened = feed.advance(RevealPhase::Open, Vec::new());
        assert_eq!(opened, Some(FeedLayout::Empty));
    }

    #[test]
    fn one_and_two_entries_use_different_layouts() {
        let mut feed = feed();
        let single = feed
            .advance(RevealPhase::Open, vec![record("http://a.com", 0.1)])
            .unwrap();
        assert!(matches!(single, FeedLayout::Single { .. }));

        let pair = feed
            .update(vec![
                record("http://a.com", 0.1),
                record("http://b.com", 0.2),
                record("http://c.com", 0.3),
            ])
            .unwrap();
        match pair {
            FeedLayout::Pair { summary, first, second } => {
                assert_eq!(summary.total, 3);
                assert_eq!(summary.titles, vec!["http://a.com title", "http://b.com title"]);
                assert_eq!(first.url(), "http://a.com");
                assert_eq!(second.url(), "http://b.com");
            }
            other => panic!("expected pair, got {other:?}"),
        }
    }

    #[test]
    fn reorder_without_membership_change_is_not_rerendered() {
        let mut feed = feed();
        feed.advance(
            RevealPhase::Open,
            vec![record("http://a.com", 0.1), record("http://b.com", 0.2)],
        );

        // Same two on top, swapped, plus a third further down.
        let swapped = vec![
            record("http://a.com", 0.3),
            record("http://b.com", 0.2),
            record("http://c.com", 0.9),
        ];
        assert_eq!(feed.update(swapped), None);

        let displaced = vec![
            record("http://a.com", 0.3),
            record("http://b.com", 0.2),
            record("http://c.com", 0.1),
        ];
        let layout = feed.update(displaced).unwrap();
        let urls: Vec<&str> = layout.entries().into_iter().map(Record::url).collect();
        assert_eq!(urls, vec!["http://c.com", "http://b.com"]);
    }

    #[test]
    fn blocked_hosts_never_reach_the_feed() {
        let mut feed = NotificationFeed::new(RelevanceOrder::default(), vec!["Ads.example.com".to_string()]);
        let layout = feed
            .advance(
                RevealPhase::Open,
                vec![record("https://ads.example.com/x", 0.0), record("http://a.com", 0.5)],
            )
            .unwrap();
        match layout {
            FeedLayout::Single { entry } => assert_eq!(entry.url(), "http://a.com"),
            other => panic!("expected single, got {other:?}"),
        }
    }
}
