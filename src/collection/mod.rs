//! Identity-keyed record store with server-assigned grouping.
//!
//! Every record sits in exactly one place: the group named by its metadata,
//! or the ungrouped set. Mutations keep that true; reads hand out clones.

mod group;
pub mod rssi;

pub use group::Group;
pub use rssi::{Region, RssiFilter};

use std::collections::{BTreeSet, HashMap};

use crate::feed::ranking::RankOrder;
use crate::models::{Identity, Record, ResolvedMetadata, Sighting};

/// Outcome of folding one sighting into the collection.
#[derive(Debug, Clone)]
pub struct SightingUpdate {
    pub record: Record,
    pub is_new: bool,
    /// The record should be sent to the resolution service.
    pub needs_resolution: bool,
}

#[derive(Debug, Default)]
pub struct Collection {
    records: HashMap<Identity, Record>,
    groups: HashMap<String, Group>,
    ungrouped: BTreeSet<Identity>,
    filters: HashMap<Identity, RssiFilter>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a collection from persisted records.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut collection = Self::new();
        for record in records {
            let identity = record.identity().clone();
            if let Some(rssi) = record.sighting().data().rssi {
                collection
                    .filters
                    .entry(identity.clone())
                    .or_default()
                    .update(rssi, record.sighting().data().tx_power);
            }
            collection.place(&identity, record.group().map(String::from));
            collection.records.insert(identity, record);
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &Identity) -> Option<&Record> {
        self.records.get(identity)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn ungrouped(&self) -> impl Iterator<Item = &Identity> {
        self.ungrouped.iter()
    }

    /// Resolvable records the service has not described yet.
    pub fn unresolved(&self) -> Vec<Record> {
        self.records
            .values()
            .filter(|record| record.metadata().is_none() && record.sighting().is_resolvable())
            .cloned()
            .collect()
    }

    pub fn add_sighting(&mut self, sighting: Sighting) -> SightingUpdate {
        let identity = Identity::of(&sighting);

        let (smoothed_rssi, distance_m) = match sighting.data().rssi {
            Some(rssi) => {
                let filter = self.filters.entry(identity.clone()).or_default();
                filter.update(rssi, sighting.data().tx_power);
                (filter.smoothed(), filter.distance_m())
            }
            None => (None, None),
        };

        let is_new = !self.records.contains_key(&identity);
        if is_new {
            self.ungrouped.insert(identity.clone());
        }
        let record = self
            .records
            .entry(identity.clone())
            .or_insert_with(|| Record::new(identity.clone(), sighting.clone()));

        let old_group = record.group().map(String::from);

        // A stable address that now advertises another URL invalidates
        // whatever the service said about the old one.
        let url_changed = !is_new && record.url() != sighting.url();
        if url_changed {
            record.metadata = None;
        }

        record.sighting = sighting;
        if smoothed_rssi.is_some() {
            record.smoothed_rssi = smoothed_rssi;
            record.distance_m = distance_m;
        }

        let mut needs_resolution = false;
        if !record.sighting.is_resolvable() {
            record.metadata = Some(ResolvedMetadata::transport_only(&record.sighting));
        } else if record.metadata.is_none() {
            needs_resolution = is_new || url_changed;
        }

        let snapshot = record.clone();
        let new_group = snapshot.group().map(String::from);
        if old_group != new_group {
            self.detach(&identity, old_group.as_deref());
            self.place(&identity, new_group);
        } else if let Some(group) = old_group.and_then(|id| self.groups.get_mut(&id)) {
            group.invalidate();
        }

        SightingUpdate {
            record: snapshot,
            is_new,
            needs_resolution,
        }
    }

    /// Attaches metadata and moves the record into the group it names.
    /// Returns `None` when the record has gone away in the meantime, or now
    /// advertises a different URL than the one that was resolved.
    pub fn apply_metadata(&mut self, identity: &Identity, metadata: ResolvedMetadata) -> Option<Record> {
        let record = self.records.get_mut(identity)?;
        if metadata.request_url != record.url() {
            return None;
        }
        let old_group = record.group().map(String::from);
        let new_group = metadata.group().map(String::from);
        // Keep an icon that already arrived for the same icon URL.
        let icon = record
            .metadata
            .as_ref()
            .filter(|old| old.icon_url.is_some() && old.icon_url == metadata.icon_url)
            .and_then(|old| old.icon.clone());
        record.metadata = Some(metadata);
        if let Some(meta) = record.metadata.as_mut() {
            if meta.icon.is_none() {
                meta.icon = icon;
            }
        }
        let snapshot = record.clone();

        if old_group == new_group {
            if let Some(group) = old_group.and_then(|id| self.groups.get_mut(&id)) {
                group.invalidate();
            }
        } else {
            self.detach(identity, old_group.as_deref());
            self.place(identity, new_group);
        }
        Some(snapshot)
    }

    /// Stores icon bytes on every record whose metadata points at `icon_url`.
    pub fn apply_icon(&mut self, icon_url: &str, bytes: &[u8]) -> Vec<Record> {
        let mut updated = Vec::new();
        for record in self.records.values_mut() {
            if let Some(meta) = record.metadata.as_mut() {
                if meta.icon_url.as_deref() == Some(icon_url) {
                    meta.icon = Some(bytes.to_vec());
                    updated.push(record.clone());
                }
            }
        }
        updated
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<Record> {
        let record = self.records.remove(identity)?;
        self.detach(identity, record.group());
        self.filters.remove(identity);
        Some(record)
    }

    /// Removes every record `keep` rejects and returns them.
    pub fn retain(&mut self, mut keep: impl FnMut(&Record) -> bool) -> Vec<Record> {
        let doomed: Vec<Identity> = self
            .records
            .values()
            .filter(|record| !keep(record))
            .map(|record| record.identity().clone())
            .collect();
        doomed
            .iter()
            .filter_map(|identity| self.remove(identity))
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.groups.clear();
        self.ungrouped.clear();
        self.filters.clear();
    }

    /// Records with metadata, each group represented once by its top member
    /// under `order`. Unsorted; callers sort outside whatever lock guards
    /// the collection.
    pub fn representatives(&mut self, order: &dyn RankOrder) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .ungrouped
            .iter()
            .filter_map(|identity| self.records.get(identity))
            .filter(|record| record.metadata().is_some())
            .cloned()
            .collect();

        for group in self.groups.values_mut() {
            if let Some(top) = group.top(&self.records, order) {
                if let Some(record) = self.records.get(&top) {
                    out.push(record.clone());
                }
            }
        }
        out
    }

    fn detach(&mut self, identity: &Identity, group_id: Option<&str>) {
        match group_id {
            Some(id) => {
                let now_empty = match self.groups.get_mut(id) {
                    Some(group) => {
                        group.remove(identity);
                        group.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.groups.remove(id);
                }
            }
            None => {
                self.ungrouped.remove(identity);
            }
        }
    }

    fn place(&mut self, identity: &Identity, group_id: Option<String>) {
        match group_id {
            Some(id) => {
                self.groups
                    .entry(id.clone())
                    .or_insert_with(|| Group::new(id))
                    .insert(identity.clone());
            }
            None => {
                self.ungrouped.insert(identity.clone());
            }
        }
    }

    #[cfg(test)]
    fn assert_placement_invariant(&self) {
        for identity in self.records.keys() {
            let in_groups = self.groups.values().filter(|g| g.contains(identity)).count();
            let in_ungrouped = usize::from(self.ungrouped.contains(identity));
            assert_eq!(in_groups + in_ungrouped, 1, "{identity} placed {} times", in_groups + in_ungrouped);
        }
        let placed: usize = self.groups.values().map(Group::len).sum::<usize>() + self.ungrouped.len();
        assert_eq!(placed, self.records.len());
        assert!(self.groups.values().all(|g| !g.is_empty()));
    }
}
