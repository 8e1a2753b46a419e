// OpenDirectory, the pluggable directory management backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2023  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ldap::model::{Entry, SearchScope};

/// A bounded cache of base-scope search results.
///
/// The key encodes base, scope, filter and the sorted attribute selection.
/// Invalidation removes every key whose string prefix is the written dn, so a
/// write to a dn can never leave a stale result for it behind.
pub struct SearchCache {
    max: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedSearch>>,
}

struct CachedSearch {
    entries: Vec<Entry>,
    stored: Instant,
}

impl SearchCache {
    pub fn new(max: usize, ttl: Duration) -> Self {
        Self {
            max,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cache key of a search.
    pub fn key(
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: Option<&[String]>,
    ) -> String {
        let mut attributes = attributes.map(|a| a.to_vec()).unwrap_or_default();
        attributes.sort();
        format!(
            "{}|{}|{}|{}",
            base.to_ascii_lowercase(),
            scope.as_str(),
            filter,
            attributes.join(",")
        )
    }

    pub fn get(&self, key: &str) -> Option<Vec<Entry>> {
        let mut entries = self.entries.lock().expect("search cache");
        match entries.get(key) {
            Some(cached) if cached.stored.elapsed() <= self.ttl => Some(cached.entries.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, result: Vec<Entry>) {
        if self.max == 0 {
            return;
        }
        let mut entries = self.entries.lock().expect("search cache");
        let ttl = self.ttl;
        entries.retain(|_, cached| cached.stored.elapsed() <= ttl);
        if entries.len() >= self.max {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.stored)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CachedSearch {
                entries: result,
                stored: Instant::now(),
            },
        );
    }

    /// Drop every cached result whose key starts with the dn.
    pub fn invalidate(&self, dn: &str) {
        let prefix = dn.to_ascii_lowercase();
        self.entries
            .lock()
            .expect("search cache")
            .retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("search cache").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SearchCache {
        SearchCache::new(2, Duration::from_secs(300))
    }

    fn entry(dn: &str) -> Vec<Entry> {
        vec![Entry::new(dn)]
    }

    #[test]
    fn keys_normalize_base_case_and_attribute_order() {
        let attributes = ["mail".to_string(), "cn".to_string()];
        let key = SearchCache::key(
            "OU=Members,DC=EX",
            SearchScope::Base,
            "(objectClass=*)",
            Some(&attributes),
        );
        assert_eq!(key, "ou=members,dc=ex|base|(objectClass=*)|cn,mail");
    }

    #[test]
    fn hits_return_the_stored_entries() {
        let cache = cache();
        let key = SearchCache::key("uid=a,dc=ex", SearchScope::Base, "(objectClass=*)", None);
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), entry("uid=a,dc=ex"));
        let hit = cache.get(&key).expect("cached entries");
        assert_eq!(hit[0].dn, "uid=a,dc=ex");
    }

    #[test]
    fn invalidation_removes_results_below_the_dn() {
        let cache = cache();
        let key = SearchCache::key("uid=a,dc=ex", SearchScope::Base, "(objectClass=*)", None);
        cache.put(key.clone(), entry("uid=a,dc=ex"));
        cache.invalidate("UID=A,DC=EX");
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn invalidation_keeps_unrelated_results() {
        let cache = cache();
        let key = SearchCache::key("uid=b,dc=ex", SearchScope::Base, "(objectClass=*)", None);
        cache.put(key.clone(), entry("uid=b,dc=ex"));
        cache.invalidate("uid=a,dc=ex");
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn the_cache_is_bounded() {
        let cache = cache();
        for index in 0..5 {
            let key = SearchCache::key(
                &format!("uid={},dc=ex", index),
                SearchScope::Base,
                "(objectClass=*)",
                None,
            );
            cache.put(key, entry("uid=x,dc=ex"));
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn a_zero_capacity_cache_stores_nothing() {
        let cache = SearchCache::new(0, Duration::from_secs(300));
        let key = SearchCache::key("uid=a,dc=ex", SearchScope::Base, "(objectClass=*)", None);
        cache.put(key.clone(), entry("uid=a,dc=ex"));
        assert!(cache.get(&key).is_none());
    }
}
