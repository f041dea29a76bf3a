// ── Handler table ──
//
// One table per handler role (act, get, set). For a key the list keeps
// provider-scoped entries in front of catch-all ones; selection takes
// the first entry that applies to the provider.

use std::collections::BTreeSet;

use dashmap::DashMap;

use super::{RegistrationConflict, RegistryKey, ServiceId};

struct Entry<H> {
    service: ServiceId,
    /// Empty = applies to every provider.
    providers: BTreeSet<String>,
    handler: H,
}

impl<H> Entry<H> {
    fn is_catch_all(&self) -> bool {
        self.providers.is_empty()
    }

    fn applies_to(&self, provider: &str) -> bool {
        self.is_catch_all() || self.providers.contains(provider)
    }
}

pub(super) struct HandlerTable<H> {
    entries: DashMap<RegistryKey, Vec<Entry<H>>>,
    by_service: DashMap<ServiceId, Vec<RegistryKey>>,
}

impl<H: Clone> HandlerTable<H> {
    pub(super) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_service: DashMap::new(),
        }
    }

    /// Add `handler` for `key`. A conflicting entry is kept and reported.
    pub(super) fn insert(
        &self,
        service: ServiceId,
        key: &RegistryKey,
        providers: BTreeSet<String>,
        handler: H,
    ) -> Option<RegistrationConflict> {
        let entry = Entry {
            service,
            providers,
            handler,
        };
        let conflict = {
            let mut entries = self.entries.entry(key.clone()).or_default();
            let conflict = find_conflict(&entries, &entry);
            if entry.is_catch_all() {
                entries.push(entry);
            } else {
                entries.insert(0, entry);
            }
            conflict
        };

        let mut keys = self.by_service.entry(service).or_default();
        if !keys.contains(key) {
            keys.push(key.clone());
        }
        conflict
    }

    /// Drop every entry `service` contributed. Returns how many.
    pub(super) fn remove_service(&self, service: ServiceId) -> usize {
        let Some((_, keys)) = self.by_service.remove(&service) else {
            return 0;
        };

        let mut removed = 0;
        for key in keys {
            let Some(mut entries) = self.entries.get_mut(&key) else {
                continue;
            };
            let before = entries.len();
            entries.retain(|entry| entry.service != service);
            removed += before - entries.len();
            drop(entries);
            self.entries.remove_if(&key, |_, entries| entries.is_empty());
        }
        removed
    }

    pub(super) fn services(&self, key: &RegistryKey) -> Vec<ServiceId> {
        self.entries
            .get(key)
            .map(|entries| entries.iter().map(|entry| entry.service).collect())
            .unwrap_or_default()
    }

    pub(super) fn keys(&self) -> Vec<RegistryKey> {
        let mut keys: Vec<RegistryKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub(super) fn select(&self, key: &RegistryKey, provider: &str) -> Option<H> {
        self.entries.get(key).and_then(|entries| {
            entries
                .iter()
                .find(|entry| entry.applies_to(provider))
                .map(|entry| entry.handler.clone())
        })
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn service_count(&self) -> usize {
        self.by_service.len()
    }
}

fn find_conflict<H>(entries: &[Entry<H>], new: &Entry<H>) -> Option<RegistrationConflict> {
    if new.is_catch_all() {
        return entries
            .iter()
            .find(|entry| entry.is_catch_all())
            .map(|entry| RegistrationConflict::DuplicateCatchAll {
                existing: entry.service,
            });
    }
    entries.iter().find_map(|entry| {
        let shared: BTreeSet<String> = entry
            .providers
            .intersection(&new.providers)
            .cloned()
            .collect();
        (!shared.is_empty()).then(|| RegistrationConflict::OverlappingProviders {
            existing: entry.service,
            providers: shared,
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn key() -> RegistryKey {
        RegistryKey::new("m", "s", "r")
    }

    fn scope(providers: &[&str]) -> BTreeSet<String> {
        providers.iter().map(|p| (*p).to_owned()).collect()
    }

    #[test]
    fn scoped_entries_go_first() {
        let table = HandlerTable::new();
        table.insert(ServiceId(1), &key(), scope(&[]), "all");
        table.insert(ServiceId(2), &key(), scope(&["a"]), "a");

        assert_eq!(table.services(&key()), vec![ServiceId(2), ServiceId(1)]);
        assert_eq!(table.select(&key(), "a"), Some("a"));
        assert_eq!(table.select(&key(), "b"), Some("all"));
        assert_eq!(table.select(&RegistryKey::new("m", "s", "x"), "a"), None);
    }

    #[test]
    fn removal_is_per_service() {
        let table = HandlerTable::new();
        table.insert(ServiceId(1), &key(), scope(&["a"]), 1);
        table.insert(ServiceId(1), &RegistryKey::new("m", "s", "x"), scope(&[]), 2);
        table.insert(ServiceId(2), &key(), scope(&[]), 3);

        assert_eq!(table.remove_service(ServiceId(1)), 2);
        assert_eq!(table.keys(), vec![key()]);
        assert_eq!(table.select(&key(), "a"), Some(3));
        assert_eq!(table.service_count(), 1);
    }
}
