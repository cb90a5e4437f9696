//! Suppressing repeated tracking of the same evaluation results.
use std::{marker::PhantomData, sync::Mutex, time::Duration};

use crate::cache::Cache;

/// Results are tracked again at most once a day.
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Something a [`DedupFilter`] can recognize when it comes around again.
pub trait Deduplicate {
    /// Key identical for repeats. `None` for values that are never tracked.
    fn dedup_key(&self) -> Option<String>;
}

/// Remembers recently tracked values, up to `capacity` of them.
pub struct DedupFilter<T> {
    cache: Mutex<Cache<()>>,
    _tracked: PhantomData<fn(&T)>,
}

impl<T: Deduplicate> DedupFilter<T> {
    pub fn new(capacity: usize) -> DedupFilter<T> {
        DedupFilter::with_ttl(capacity, DEDUP_TTL)
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> DedupFilter<T> {
        DedupFilter {
            cache: Mutex::new(Cache::new(capacity, ttl)),
            _tracked: PhantomData,
        }
    }

    /// Whether `value` has not been seen within the TTL. Marks it as seen.
    pub fn should_track(&self, value: &T) -> bool {
        let Some(key) = value.dedup_key() else {
            return false;
        };
        let mut cache = self
            .cache
            .lock()
            .expect("thread holding dedup cache lock should not panic");
        if cache.get(&key).is_some() {
            return false;
        }
        cache.set(key, ());
        true
    }
}
