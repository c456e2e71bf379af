use std::collections::{BTreeSet, HashMap};

use crate::feed::ranking::RankOrder;
use crate::models::{Identity, Record};

/// Records the resolution service considers near-duplicates of one page.
///
/// The top member is cached for each ordering and recomputed on read once
/// the membership or a member changed.
#[derive(Debug, Clone)]
pub struct Group {
    id: String,
    members: BTreeSet<Identity>,
    tops: HashMap<&'static str, Identity>,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: BTreeSet::new(),
            tops: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> impl Iterator<Item = &Identity> {
        self.members.iter()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn insert(&mut self, identity: Identity) -> bool {
        self.invalidate();
        self.members.insert(identity)
    }

    pub fn remove(&mut self, identity: &Identity) -> bool {
        self.invalidate();
        self.members.remove(identity)
    }

    pub fn invalidate(&mut self) {
        self.tops.clear();
    }

    pub fn is_stale(&self, order: &dyn RankOrder) -> bool {
        !self.tops.contains_key(order.name())
    }

    pub fn top(
        &mut self,
        records: &HashMap<Identity, Record>,
        order: &dyn RankOrder,
    ) -> Option<Identity> {
        if let Some(top) = self.tops.get(order.name()) {
            return Some(top.clone());
        }
        let best = self
            .members
            .iter()
            .filter_map(|identity| records.get(identity))
            .min_by(|a, b| order.compare(a, b))
            .map(|record| record.identity().clone())?;
        self.tops.insert(order.name(), best.clone());
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ranking::{DefaultOrder, DistanceOrder};
    use crate::models::{ResolvedMetadata, Sighting, TransportKind};

    fn grouped(url: &str, rank: f64) -> Record {
        let sighting = Sighting::builder(TransportKind::Ble, url).build();
        let mut record = Record::new(Identity::of(&sighting), sighting);
        record.metadata = Some(ResolvedMetadata {
            request_url: url.into(),
            site_url: url.into(),
            display_url: url.into(),
            title: None,
            description: None,
            icon_url: None,
            icon: None,
            rank,
            group_id: Some("g".into()),
            latency_ms: 0,
        });
        record
    }

    #[test]
    fn top_is_cached_until_invalidated() {
        let a = grouped("http://a.com", 0.4);
        let b = grouped("http://b.com", 0.2);
        let mut records = HashMap::new();
        records.insert(a.identity().clone(), a.clone());
        records.insert(b.identity().clone(), b.clone());

        let mut group = Group::new("g");
        group.insert(a.identity().clone());
        group.insert(b.identity().clone());

        assert_eq!(group.top(&records, &DefaultOrder).as_ref(), Some(b.identity()));
        assert!(!group.is_stale(&DefaultOrder));
        assert!(group.is_stale(&DistanceOrder));

        // A change the group was not told about keeps the cached top.
        records.get_mut(a.identity()).unwrap().metadata.as_mut().unwrap().rank = 0.1;
        assert_eq!(group.top(&records, &DefaultOrder).as_ref(), Some(b.identity()));

        group.invalidate();
        assert_eq!(group.top(&records, &DefaultOrder).as_ref(), Some(a.identity()));

        group.remove(a.identity());
        assert_eq!(group.top(&records, &DefaultOrder).as_ref(), Some(b.identity()));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn each_order_keeps_its_own_top() {
        let mut near = grouped("http://near.com", 0.9);
        near.distance_m = Some(0.3);
        let mut far = grouped("http://far.com", 0.1);
        far.distance_m = Some(8.0);
        let mut records = HashMap::new();
        records.insert(near.identity().clone(), near.clone());
        records.insert(far.identity().clone(), far.clone());

        let mut group = Group::new("g");
        group.insert(near.identity().clone());
        group.insert(far.identity().clone());

        assert_eq!(group.top(&records, &DefaultOrder).as_ref(), Some(far.identity()));
        assert_eq!(group.top(&records, &DistanceOrder).as_ref(), Some(near.identity()));
        // Reading one order no longer evicts the other.
        assert!(!group.is_stale(&DefaultOrder));
        assert!(!group.is_stale(&DistanceOrder));

        group.invalidate();
        assert!(group.is_stale(&DefaultOrder));
        assert!(group.is_stale(&DistanceOrder));
    }
}
