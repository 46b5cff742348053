use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use metrics::counter;

use crate::application::render::FormulaImage;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_HIT: &str = "mathsnap_cache_hit_total";
const METRIC_CACHE_MISS: &str = "mathsnap_cache_miss_total";

/// Cache key: the exact formula text at a given render scale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub formula: String,
    pub scale: u32,
}

impl CacheKey {
    pub fn new(formula: impl Into<String>, scale: u32) -> Self {
        Self {
            formula: formula.into(),
            scale,
        }
    }
}

/// LRU store of rendered formulas. A capacity of zero disables caching.
pub struct FormulaCache {
    entries: Option<Mutex<LruCache<CacheKey, FormulaImage>>>,
}

impl FormulaCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn disabled() -> Self {
        Self { entries: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn get(&self, formula: &str, scale: u32) -> Option<FormulaImage> {
        let entries = self.entries.as_ref()?;
        let key = CacheKey::new(formula, scale);
        let hit = mutex_lock(entries, SOURCE, "get").get(&key).cloned();
        match hit {
            Some(_) => counter!(METRIC_CACHE_HIT).increment(1),
            None => counter!(METRIC_CACHE_MISS).increment(1),
        }
        hit
    }

    /// Store a rendered image. Placeholders are never cached.
    pub fn put(&self, formula: &str, scale: u32, image: FormulaImage) {
        if image.is_placeholder() {
            return;
        }
        if let Some(entries) = self.entries.as_ref() {
            mutex_lock(entries, SOURCE, "put").put(CacheKey::new(formula, scale), image);
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = self.entries.as_ref() {
            mutex_lock(entries, SOURCE, "clear").clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|entries| mutex_lock(entries, SOURCE, "len").len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FormulaCache {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::MediaType;

    fn image(tag: &str) -> FormulaImage {
        FormulaImage::new(tag.as_bytes().to_vec(), MediaType::Png)
    }

    #[test]
    fn keys_include_scale() {
        let cache = FormulaCache::new(4);
        cache.put("x^2", 2, image("two"));

        assert_eq!(cache.get("x^2", 2), Some(image("two")));
        assert_eq!(cache.get("x^2", 3), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = FormulaCache::new(2);
        cache.put("a", 1, image("a"));
        cache.put("b", 1, image("b"));
        assert!(cache.get("a", 1).is_some());
        cache.put("c", 1, image("c"));

        assert!(cache.get("b", 1).is_none());
        assert!(cache.get("a", 1).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = FormulaCache::new(0);
        assert!(!cache.is_enabled());
        cache.put("a", 1, image("a"));
        assert!(cache.get("a", 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn placeholders_are_not_cached_and_clear_empties() {
        let cache = FormulaCache::new(4);
        cache.put("bad", 1, FormulaImage::placeholder());
        assert!(cache.get("bad", 1).is_none());

        cache.put("ok", 1, image("ok"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
