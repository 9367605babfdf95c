//! Listing cache.
//!
//! Stores raw directory listings keyed by (host, port, user, path, list
//! command, FTPS flag). Host and list command compare case-insensitively, the
//! user exactly (with "anonymous" equal to no user) and the path with the
//! rules of the stored item's server path type, so a connection that has not
//! detected its path type yet still finds listings stored by another one.
//! Only complete listings are stored.

use crate::ftp::paths::{self, ServerPathType, UserPart};
use crate::ftp::types::normalize_user;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use zeroize::Zeroize;

/// Default byte budget for all cached listings.
pub const DEFAULT_CACHE_BUDGET: usize = 4 * 1024 * 1024;

/// Lookup key; borrowed so callers do not allocate for a probe.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub path: &'a str,
    pub path_type: ServerPathType,
    pub list_cmd: &'a str,
    pub is_ftps: bool,
}

/// One cached listing.
#[derive(Debug)]
pub struct ListingCacheItem {
    pub host: String,
    pub port: u16,
    /// Empty for anonymous.
    pub user: String,
    pub path: String,
    pub path_type: ServerPathType,
    pub list_cmd: String,
    pub is_ftps: bool,
    pub raw: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl ListingCacheItem {
    fn matches(&self, key: &CacheKey<'_>) -> bool {
        self.port == key.port
            && self.is_ftps == key.is_ftps
            && self.host.eq_ignore_ascii_case(key.host)
            && self.user == normalize_user(key.user)
            && self.list_cmd.eq_ignore_ascii_case(key.list_cmd)
            && paths::is_same_server_path(self.path_type, &self.path, key.path)
    }

    fn same_server(&self, host: &str, port: u16, user: &str) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host) && self.user == normalize_user(user)
    }
}

impl Drop for ListingCacheItem {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

/// Copy of a cached listing handed to the caller.
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub raw: Vec<u8>,
    pub path_type: ServerPathType,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheInner {
    /// Oldest first.
    items: Vec<ListingCacheItem>,
    total_size: usize,
    budget: usize,
    next_sequence: u64,
}

/// Process-wide listing cache. Safe to share between connections.
#[derive(Debug)]
pub struct ListingCache {
    inner: Mutex<CacheInner>,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BUDGET)
    }
}

impl ListingCache {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                items: Vec::new(),
                total_size: 0,
                budget,
                next_sequence: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn find(&self, key: &CacheKey<'_>) -> bool {
        self.lock().items.iter().any(|i| i.matches(key))
    }

    /// Copy of the cached listing for `key`.
    pub fn get_path_listing(&self, key: &CacheKey<'_>) -> Option<CachedListing> {
        let inner = self.lock();
        inner.items.iter().find(|i| i.matches(key)).map(|i| CachedListing {
            raw: i.raw.clone(),
            path_type: i.path_type,
            captured_at: i.captured_at,
        })
    }

    /// Store (or replace) a complete listing. Evicts the oldest listings
    /// while over budget; the listing just added is always kept.
    pub fn add_or_update_path_listing(&self, key: &CacheKey<'_>, raw: &[u8], captured_at: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(pos) = inner.items.iter().position(|i| i.matches(key)) {
            let old = inner.items.remove(pos);
            inner.total_size -= old.raw.len();
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.total_size += raw.len();
        inner.items.push(ListingCacheItem {
            host: key.host.to_string(),
            port: key.port,
            user: normalize_user(key.user).to_string(),
            path: key.path.to_string(),
            path_type: key.path_type,
            list_cmd: key.list_cmd.to_string(),
            is_ftps: key.is_ftps,
            raw: raw.to_vec(),
            captured_at,
            sequence,
        });

        if inner.total_size > inner.budget {
            let mut remove = 0;
            let mut freed = 0;
            let last = inner.items.len() - 1;
            while remove < last && inner.total_size - freed > inner.budget {
                freed += inner.items[remove].raw.len();
                remove += 1;
            }
            if remove > 0 {
                inner.items.drain(..remove);
                inner.total_size -= freed;
                log::debug!("Listing cache: evicted {} listing(s), {} bytes", remove, freed);
            }
        }
    }

    /// Drop the listing of `path` and, unless `ignore_subtree`, of every
    /// path below it.
    pub fn refresh_on_path(
        &self,
        host: &str,
        port: u16,
        user: &str,
        path: &str,
        ignore_subtree: bool,
    ) {
        let mut inner = self.lock();
        let before = inner.items.len();
        let mut freed = 0;
        inner.items.retain(|i| {
            let hit = i.same_server(host, port, user)
                && if ignore_subtree {
                    paths::is_same_server_path(i.path_type, path, &i.path)
                } else {
                    paths::is_prefix_of_server_path(i.path_type, path, &i.path)
                };
            if hit {
                freed += i.raw.len();
            }
            !hit
        });
        inner.total_size -= freed;
        if inner.items.len() != before {
            log::debug!("Listing cache: refreshed {} listing(s) under {}", before - inner.items.len(), path);
        }
    }

    /// A change was made at `user_part` (`//user@host:port/path`): drop the
    /// listing of that path, and with `include_subdirs` of its subtree.
    pub fn accept_change_on_path_notification(&self, user_part: &str, include_subdirs: bool) {
        let up = match UserPart::parse(user_part) {
            Some(up) => up,
            None => {
                log::warn!("Ignoring change notification with invalid path: {}", user_part);
                return;
            }
        };
        let user = up.effective_user().unwrap_or("");
        let port = up.port_or_default();
        let mut inner = self.lock();
        let mut freed = 0;
        inner.items.retain(|i| {
            if !i.same_server(&up.host, port, user) {
                return true;
            }
            let changed = notification_path(i.path_type, up.path.as_deref().unwrap_or(""));
            let hit = if include_subdirs {
                paths::is_prefix_of_server_path(i.path_type, &changed, &i.path)
            } else {
                paths::is_same_server_path(i.path_type, &changed, &i.path)
            };
            if hit {
                freed += i.raw.len();
            }
            !hit
        });
        inner.total_size -= freed;
    }

    pub fn total_size(&self) -> usize {
        self.lock().total_size
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.total_size = 0;
    }

    pub fn set_budget(&self, budget: usize) {
        self.lock().budget = budget;
    }
}

/// Server path addressed by the path part of a user-part string.
fn notification_path(ty: ServerPathType, path: &str) -> String {
    match ty {
        ServerPathType::IbmZVm | ServerPathType::OpenVms | ServerPathType::Os2 | ServerPathType::Mvs => {
            path.to_string()
        }
        _ => format!("/{}", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(path: &'a str) -> CacheKey<'a> {
        CacheKey {
            host: "ftp.example.com",
            port: 21,
            user: "anonymous",
            path,
            path_type: ServerPathType::Unix,
            list_cmd: "LIST",
            is_ftps: false,
        }
    }

    #[test]
    fn test_round_trip_with_equivalent_key() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/pub"), b"listing", Utc::now());
        let mut other = key("/pub/");
        other.host = "FTP.EXAMPLE.COM";
        other.user = "";
        other.list_cmd = "list";
        let got = cache.get_path_listing(&other).unwrap();
        assert_eq!(got.raw, b"listing");
        assert!(!cache.find(&CacheKey { is_ftps: true, ..key("/pub") }));
        assert!(!cache.find(&CacheKey { user: "bob", ..key("/pub") }));
    }

    #[test]
    fn test_update_replaces() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/a"), b"one", Utc::now());
        cache.add_or_update_path_listing(&key("/a"), b"second", Utc::now());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 6);
    }

    #[test]
    fn test_refresh_subtree() {
        let cache = ListingCache::default();
        for p in ["/pub", "/pub/a", "/pub/a/b", "/public", "/other"] {
            cache.add_or_update_path_listing(&key(p), b"x", Utc::now());
        }
        cache.refresh_on_path("ftp.example.com", 21, "", "/pub", false);
        assert!(!cache.find(&key("/pub")));
        assert!(!cache.find(&key("/pub/a/b")));
        assert!(cache.find(&key("/public")));
        assert!(cache.find(&key("/other")));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_size(), 2);
    }

    #[test]
    fn test_refresh_single_path() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/pub"), b"x", Utc::now());
        cache.add_or_update_path_listing(&key("/pub/a"), b"x", Utc::now());
        cache.refresh_on_path("ftp.example.com", 21, "anonymous", "/pub/", true);
        assert!(!cache.find(&key("/pub")));
        assert!(cache.find(&key("/pub/a")));
    }

    #[test]
    fn test_lookup_ignores_caller_path_type() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/pub"), b"x", Utc::now());
        cache.add_or_update_path_listing(&key("/pub/sub"), b"x", Utc::now());
        let undetected = CacheKey {
            path_type: ServerPathType::Unknown,
            ..key("/pub/")
        };
        assert!(cache.find(&undetected));
        cache.refresh_on_path("ftp.example.com", 21, "", "/pub", false);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let cache = ListingCache::new(10);
        cache.add_or_update_path_listing(&key("/1"), &[0u8; 4], Utc::now());
        cache.add_or_update_path_listing(&key("/2"), &[0u8; 4], Utc::now());
        cache.add_or_update_path_listing(&key("/3"), &[0u8; 4], Utc::now());
        assert!(!cache.find(&key("/1")));
        assert!(cache.find(&key("/2")));
        assert!(cache.find(&key("/3")));
        assert_eq!(cache.total_size(), 8);

        cache.add_or_update_path_listing(&key("/big"), &[0u8; 50], Utc::now());
        assert_eq!(cache.len(), 1);
        assert!(cache.find(&key("/big")));
        assert_eq!(cache.total_size(), 50);
    }

    #[test]
    fn test_change_notification() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/pub"), b"x", Utc::now());
        cache.add_or_update_path_listing(&key("/pub/sub"), b"x", Utc::now());
        cache.accept_change_on_path_notification("//ftp.example.com/pub/sub", false);
        assert!(cache.find(&key("/pub")));
        assert!(!cache.find(&key("/pub/sub")));

        cache.add_or_update_path_listing(&key("/pub/sub"), b"x", Utc::now());
        cache.accept_change_on_path_notification("//anonymous@FTP.example.com:21/pub", true);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_notification_other_server_ignored() {
        let cache = ListingCache::default();
        cache.add_or_update_path_listing(&key("/pub"), b"x", Utc::now());
        cache.accept_change_on_path_notification("//bob@ftp.example.com/pub", true);
        cache.accept_change_on_path_notification("//ftp.example.com:2121/pub", true);
        assert_eq!(cache.len(), 1);
    }
}
