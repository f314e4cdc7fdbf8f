use std::sync::{Arc, Mutex};

use itertools::Itertools;
use log::warn;

use crate::cache::{ResourceCache, ResourceGenerator, ResourceKey};
use crate::loading::Loadable;

/// The cache references an object took while loading. Every entry stands for one `emplace` that
/// has to be paired with an `erase` when the owner is released.
pub(crate) struct Dependencies<T> {
    entries: Mutex<Vec<(ResourceKey, Arc<T>)>>,
}

impl<T: Loadable + 'static> Dependencies<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Takes one reference of `key` from the cache and remembers it.
    pub fn acquire<G: ResourceGenerator<T>>(
        &self,
        cache: &ResourceCache<T, G>,
        key: ResourceKey,
    ) -> Result<Arc<T>, crate::cache::CacheError> {
        let instance = cache.emplace(&key)?;
        self.entries
            .lock()
            .expect("Dependencies Lock")
            .push((key, instance.clone()));
        Ok(instance)
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .expect("Dependencies Lock")
            .iter()
            .map(|(_, instance)| instance.clone())
            .collect_vec()
    }

    pub fn all_finished(&self) -> bool {
        self.snapshot().iter().all(|child| child.is_finished())
    }

    pub fn any_required_errored(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|child| child.errored() && child.is_required_for_save())
    }

    pub fn errored_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|child| child.errored())
            .count()
    }

    pub fn wait_until_finished(&self) {
        for child in self.snapshot() {
            child.wait_until_finished();
        }
    }

    /// Gives every reference back to the cache.
    pub fn release<G: ResourceGenerator<T>>(&self, cache: &ResourceCache<T, G>) {
        let entries = std::mem::take(&mut *self.entries.lock().expect("Dependencies Lock"));
        for (key, instance) in entries {
            drop(instance);
            if let Err(err) = cache.erase(&key) {
                warn!("Releasing {} failed: {}", key, err);
            }
        }
    }
}
