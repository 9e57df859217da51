//! Concurrent id-keyed registries
//!
//! Insertion never overwrites an existing key and removal of a missing key
//! reports failure. No guard is held across a caller's code: bulk operations
//! copy keys out first.

use std::hash::Hash;

use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use natproxy_proto::Guid;

pub struct Registry<K, V> {
    map: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Returns false and leaves the existing entry alone if `key` is taken
    pub fn insert(&self, key: K, value: V) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|entry| *entry.key()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.map.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove and return every entry
    pub fn take_all(&self) -> Vec<V> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.remove(&key))
            .collect()
    }
}

/// Set of guids currently held by logged-in sessions
#[derive(Default)]
pub struct GuidSet {
    guids: DashSet<Guid>,
}

impl GuidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert
    pub fn reserve(&self, guid: &Guid) -> bool {
        self.guids.insert(guid.clone())
    }

    pub fn release(&self, guid: &Guid) -> bool {
        self.guids.remove(guid).is_some()
    }

    pub fn contains(&self, guid: &Guid) -> bool {
        self.guids.contains(guid)
    }

    pub fn len(&self) -> usize {
        self.guids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_insert_rejects_duplicate() {
        let reg: Registry<u32, &str> = Registry::new();
        assert!(reg.insert(1000, "alice"));
        assert!(!reg.insert(1000, "mallory"));
        assert_eq!(reg.get(&1000), Some("alice"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_remove_missing_reports_failure() {
        let reg: Registry<u32, u32> = Registry::new();
        assert_eq!(reg.remove(&7), None);
        reg.insert(7, 70);
        assert_eq!(reg.remove(&7), Some(70));
        assert_eq!(reg.remove(&7), None);
    }

    #[test]
    fn test_take_all_empties() {
        let reg: Registry<u32, u32> = Registry::new();
        for i in 0..10 {
            reg.insert(i, i * 2);
        }
        let mut taken = reg.take_all();
        taken.sort();
        assert_eq!(taken, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(reg.is_empty());
        assert!(reg.take_all().is_empty());
    }

    #[test]
    fn test_concurrent_guid_reserve_single_winner() {
        let guids = Arc::new(GuidSet::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guids = guids.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    guids.reserve(&Guid::from("alice"))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        let alice = Guid::from("alice");
        assert!(guids.release(&alice));
        assert!(!guids.release(&alice));
    }

    proptest! {
        #[test]
        fn prop_insert_is_first_writer_wins(ops in prop::collection::vec((0u32..16, any::<u16>()), 0..64)) {
            let reg: Registry<u32, u16> = Registry::new();
            let mut model = std::collections::HashMap::new();
            for (key, value) in ops {
                let inserted = reg.insert(key, value);
                prop_assert_eq!(inserted, !model.contains_key(&key));
                model.entry(key).or_insert(value);
            }
            prop_assert_eq!(reg.len(), model.len());
            for (key, value) in model {
                prop_assert_eq!(reg.get(&key), Some(value));
            }
        }
    }
}
