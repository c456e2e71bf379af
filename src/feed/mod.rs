pub mod notify;
pub mod ranking;

pub use notify::{FeedLayout, FeedSummary, NotificationFeed, RevealPhase, RevealWindows};
pub use ranking::{sort_records, DefaultOrder, DistanceOrder, RankOrder, RelevanceOrder};
