use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::models::{ChangedEntry, Identifier, ReadingSet, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    /// When the value was last changed, not when it was last seen
    pub updated: DateTime<Utc>,
}

pub type Snapshot = Arc<HashMap<Identifier, CachedValue>>;

/// Latest value per identifier of one device.
///
/// Merges build a new map and swap it in, so readers always hold a complete
/// pre- or post-merge snapshot.
#[derive(Default)]
pub struct ValueCache {
    current: RwLock<Snapshot>,
    merge_lock: Mutex<()>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, identifier: &str) -> Option<CachedValue> {
        self.snapshot().get(&Identifier::from(identifier)).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn clear(&self) {
        let _guard = self.merge_lock.lock().unwrap_or_else(|e| e.into_inner());
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(HashMap::new());
    }

    /// Store every reading and return the ones whose value differs from the
    /// stored one, first sightings included, in reading order.
    pub fn merge(&self, readings: ReadingSet) -> Vec<ChangedEntry> {
        let _guard = self.merge_lock.lock().unwrap_or_else(|e| e.into_inner());

        let base = self.snapshot();
        let mut next: Option<HashMap<Identifier, CachedValue>> = None;
        let mut changed = Vec::new();
        let now = Utc::now();

        for reading in readings {
            let map: &HashMap<Identifier, CachedValue> = match &next {
                Some(m) => m,
                None => base.as_ref(),
            };
            let previous = match map.get(&reading.identifier) {
                Some(cached) if cached.value == reading.value => continue,
                Some(cached) => Some(cached.value.clone()),
                None => None,
            };

            next.get_or_insert_with(|| (*base).clone()).insert(
                reading.identifier.clone(),
                CachedValue { value: reading.value.clone(), updated: now },
            );
            changed.push(ChangedEntry {
                identifier: reading.identifier,
                value: reading.value,
                previous,
            });
        }

        if let Some(map) = next {
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(kwh: f64) -> ReadingSet {
        [("1-0:1.8.0*255", Value::numeric(kwh, Some("kWh")))].into_iter().collect()
    }

    #[test]
    fn test_merge_reports_changes_only() {
        let cache = ValueCache::new();

        let first = cache.merge(energy(1234.5));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous, None);

        assert!(cache.merge(energy(1234.5)).is_empty());

        let third = cache.merge(energy(1235.0));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].previous, Some(Value::numeric(1234.5, Some("kWh"))));
        assert_eq!(cache.get("1-0:1.8.0*255").unwrap().value.as_f64(), Some(1235.0));
    }

    #[test]
    fn test_unchanged_value_keeps_timestamp() {
        let cache = ValueCache::new();
        cache.merge(energy(1.0));
        let before = cache.get("1-0:1.8.0*255").unwrap().updated;
        cache.merge(energy(1.0));
        assert_eq!(cache.get("1-0:1.8.0*255").unwrap().updated, before);
    }

    #[test]
    fn test_old_snapshot_is_not_torn() {
        let cache = ValueCache::new();
        cache.merge(energy(1.0));
        let old = cache.snapshot();

        let mut set = energy(2.0);
        set.push("1-0:2.8.0*255", Value::numeric(5.0, Some("kWh")));
        assert_eq!(cache.merge(set).len(), 2);

        assert_eq!(old.len(), 1);
        assert_eq!(old.get(&Identifier::from("1-0:1.8.0*255")).unwrap().value.as_f64(), Some(1.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_readers_see_whole_merges() {
        let cache = Arc::new(ValueCache::new());
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let v = i as f64;
                    let set: ReadingSet = [
                        ("a", Value::numeric(v, None)),
                        ("b", Value::numeric(v, None)),
                    ]
                    .into_iter()
                    .collect();
                    cache.merge(set);
                }
            })
        };

        for _ in 0..200 {
            let snap = cache.snapshot();
            let a = snap.get(&Identifier::from("a")).map(|c| c.value.clone());
            let b = snap.get(&Identifier::from("b")).map(|c| c.value.clone());
            assert_eq!(a, b);
        }
        writer.join().unwrap();
        assert_eq!(cache.get("a").unwrap().value.as_f64(), Some(199.0));
    }

    #[test]
    fn test_clear() {
        let cache = ValueCache::new();
        cache.merge(energy(1.0));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.merge(energy(1.0)).len(), 1);
    }
}
