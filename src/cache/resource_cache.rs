use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use itertools::Itertools;
use log::trace;
use thiserror::Error;

use crate::cache::key::{ContextId, Identity, ResourceKey};
use crate::loading::{AsyncLoader, Loadable};

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Caches whose `apply` is currently running on this thread.
    static VISITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Error, Debug)]
pub enum CacheError {
    /// Also returned for every `erase` beyond the number of `emplace`s.
    #[error("{key} is not present in the {cache} cache")]
    NotPresent { cache: &'static str, key: ResourceKey },

    #[error("A visitor re-entered the {cache} cache it is being applied from")]
    Reentrant { cache: &'static str },

    #[error("The loader rejected {key}, it has been shut down")]
    LoaderStopped { key: ResourceKey },
}

/// Constructs the (not yet loaded) instance for a key. Runs under the cache lock, so this has to be
/// cheap: the actual work belongs into [`Loadable::begin_load`].
pub trait ResourceGenerator<T> {
    fn generate(&self, key: &ResourceKey) -> T;
}

impl<T, F> ResourceGenerator<T> for F
where
    F: Fn(&ResourceKey) -> T,
{
    fn generate(&self, key: &ResourceKey) -> T {
        self(key)
    }
}

struct CacheEntry<T> {
    instance: Arc<T>,
    refcount: usize,
}

type Shard<T> = Arc<Mutex<HashMap<Identity, CacheEntry<T>>>>;

/// A reference counted registry of [`Loadable`]s, deduplicating instances per [`ResourceKey`].
///
/// Every context gets its own mutex-guarded shard; refcount and map mutations of one context always
/// happen under that shard's lock, which makes `emplace` the single point where instances come to
/// life. Newly created instances are submitted to the loader right away.
///
/// Entries reaching a refcount of zero are removed from the map immediately, while still holding
/// the lock. The slow part of the teardown ([`AsyncLoader::ensure_deletable`], [`Loadable::release`])
/// happens afterwards, without the lock. An `emplace` of the same key during that window constructs
/// a new, independent instance.
pub struct ResourceCache<T, G> {
    id: usize,
    name: &'static str,
    loader: Arc<AsyncLoader>,
    generator: G,
    shards: DashMap<ContextId, Shard<T>>,
}

impl<T, G> ResourceCache<T, G>
where
    T: Loadable + 'static,
    G: ResourceGenerator<T>,
{
    pub fn new(name: &'static str, loader: Arc<AsyncLoader>, generator: G) -> Self {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            loader,
            generator,
            shards: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn loader(&self) -> &Arc<AsyncLoader> {
        &self.loader
    }

    fn shard(&self, context: ContextId) -> Shard<T> {
        self.shards.entry(context).or_default().value().clone()
    }

    fn existing_shard(&self, context: ContextId) -> Option<Shard<T>> {
        self.shards.get(&context).map(|shard| shard.value().clone())
    }

    fn check_reentrancy(&self) -> Result<(), CacheError> {
        if VISITING.with_borrow(|visiting| visiting.contains(&self.id)) {
            return Err(CacheError::Reentrant { cache: self.name });
        }
        Ok(())
    }

    /// Returns the instance for `key`, constructing and submitting it on first use. Every successful
    /// call has to be paired with exactly one [`ResourceCache::erase`].
    pub fn emplace(&self, key: &ResourceKey) -> Result<Arc<T>, CacheError> {
        self.check_reentrancy()?;

        let shard = self.shard(key.context);
        let mut entries = shard.lock().expect("Resource Cache Lock");
        if let Some(entry) = entries.get_mut(&key.identity) {
            entry.refcount += 1;
            return Ok(entry.instance.clone());
        }

        let instance = Arc::new(self.generator.generate(key));
        if !self.loader.submit(instance.clone()) {
            return Err(CacheError::LoaderStopped { key: key.clone() });
        }

        trace!("{}: created {}", self.name, key);
        entries.insert(
            key.identity.clone(),
            CacheEntry {
                instance: instance.clone(),
                refcount: 1,
            },
        );
        Ok(instance)
    }

    /// Gives back one reference and returns the remaining refcount. The call that drops the last
    /// reference blocks until no loader worker touches the instance anymore.
    pub fn erase(&self, key: &ResourceKey) -> Result<usize, CacheError> {
        self.check_reentrancy()?;

        let not_present = || CacheError::NotPresent {
            cache: self.name,
            key: key.clone(),
        };

        let shard = self.existing_shard(key.context).ok_or_else(not_present)?;
        let instance = {
            let mut entries = shard.lock().expect("Resource Cache Lock");
            let entry = entries.get_mut(&key.identity).ok_or_else(not_present)?;
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return Ok(entry.refcount);
            }

            entries
                .remove(&key.identity)
                .map(|entry| entry.instance)
                .ok_or_else(not_present)?
        };

        self.loader.ensure_deletable(instance.as_ref());
        instance.release();
        trace!("{}: dropped {}", self.name, key);
        Ok(0)
    }

    /// Visits every entry of every context. Each context's lock is held while its entries are
    /// visited, so the visitor must not call back into this cache; doing so yields
    /// [`CacheError::Reentrant`] instead of a deadlock.
    pub fn apply<F>(&self, mut visitor: F) -> Result<(), CacheError>
    where
        F: FnMut(&ResourceKey, &Arc<T>),
    {
        self.check_reentrancy()?;

        let shards = self
            .shards
            .iter()
            .map(|shard| (*shard.key(), shard.value().clone()))
            .sorted_by_key(|(context, _)| *context)
            .collect_vec();

        let _guard = VisitGuard::enter(self.id);
        for (context, shard) in shards {
            Self::visit_shard(context, &shard, &mut visitor);
        }
        Ok(())
    }

    /// Like [`ResourceCache::apply`], restricted to one context.
    pub fn context_aware_apply<F>(&self, context: ContextId, mut visitor: F) -> Result<(), CacheError>
    where
        F: FnMut(&ResourceKey, &Arc<T>),
    {
        self.check_reentrancy()?;

        let Some(shard) = self.existing_shard(context) else {
            return Ok(());
        };

        let _guard = VisitGuard::enter(self.id);
        Self::visit_shard(context, &shard, &mut visitor);
        Ok(())
    }

    fn visit_shard<F>(context: ContextId, shard: &Shard<T>, visitor: &mut F)
    where
        F: FnMut(&ResourceKey, &Arc<T>),
    {
        let entries = shard.lock().expect("Resource Cache Lock");
        for (identity, entry) in entries.iter() {
            let key = ResourceKey {
                context,
                identity: identity.clone(),
            };
            visitor(&key, &entry.instance);
        }
    }

    pub fn refcount(&self, key: &ResourceKey) -> Option<usize> {
        let shard = self.existing_shard(key.context)?;
        let entries = shard.lock().expect("Resource Cache Lock");
        entries.get(&key.identity).map(|entry| entry.refcount)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.refcount(key).is_some()
    }

    pub fn len(&self) -> usize {
        let shards = self
            .shards
            .iter()
            .map(|shard| shard.value().clone())
            .collect_vec();
        shards
            .iter()
            .map(|shard| shard.lock().expect("Resource Cache Lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct VisitGuard(usize);

impl VisitGuard {
    fn enter(cache_id: usize) -> Self {
        VISITING.with_borrow_mut(|visiting| visiting.push(cache_id));
        Self(cache_id)
    }
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        VISITING.with_borrow_mut(|visiting| {
            if let Some(position) = visiting.iter().rposition(|&id| id == self.0) {
                visiting.remove(position);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::{LoadError, LoadState, LoadStatus};
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::sync::{Barrier, Weak};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        releases: AtomicUsize,
    }

    struct CountingAsset {
        name: String,
        status: LoadStatus,
        counters: Arc<Counters>,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    impl Loadable for CountingAsset {
        fn status(&self) -> &LoadStatus {
            &self.status
        }

        fn identity(&self) -> &str {
            &self.name
        }

        fn begin_load(&self) -> Result<(), LoadError> {
            if let Some((started, gate)) = self.gate.lock().unwrap().take() {
                started.send(()).unwrap();
                gate.recv().unwrap();
            }
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_cache(
        loader: &Arc<AsyncLoader>,
        counters: &Arc<Counters>,
    ) -> ResourceCache<CountingAsset, impl Fn(&ResourceKey) -> CountingAsset + use<>> {
        let counters = counters.clone();
        ResourceCache::new("counting", loader.clone(), move |key: &ResourceKey| {
            CountingAsset {
                name: key.to_string(),
                status: LoadStatus::new(),
                counters: counters.clone(),
                gate: Mutex::new(None),
            }
        })
    }

    #[test]
    fn emplace_twice_erase_twice() {
        let loader = Arc::new(AsyncLoader::start(0).unwrap());
        assert_eq!(loader.worker_count(), 1);
        let counters = Arc::new(Counters::default());
        let cache = counting_cache(&loader, &counters);
        let key = ResourceKey::path(ContextId(1), "tex1");

        let first = cache.emplace(&key).unwrap();
        let second = cache.emplace(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.refcount(&key), Some(2));

        loader.wait_until_idle().unwrap();
        assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
        assert_eq!(first.status().state(), LoadState::Ready);

        assert_eq!(cache.erase(&key).unwrap(), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);

        let weak: Weak<CountingAsset> = Arc::downgrade(&first);
        drop((first, second));
        assert!(weak.upgrade().is_some(), "the cache still holds the instance");

        assert_eq!(cache.erase(&key).unwrap(), 0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert!(!cache.contains(&key));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn erasing_more_than_emplacing_is_an_error() {
        let loader = Arc::new(AsyncLoader::start(1).unwrap());
        let counters = Arc::new(Counters::default());
        let cache = counting_cache(&loader, &counters);
        let key = ResourceKey::path(ContextId(0), "tex1");

        assert!(matches!(
            cache.erase(&key),
            Err(CacheError::NotPresent { .. })
        ));
        cache.emplace(&key).unwrap();
        cache.erase(&key).unwrap();
        assert!(matches!(
            cache.erase(&key),
            Err(CacheError::NotPresent { .. })
        ));
    }

    #[test]
    fn concurrent_emplace_yields_one_instance() {
        const THREADS: usize = 8;
        let loader = Arc::new(AsyncLoader::start(2).unwrap());
        let counters = Arc::new(Counters::default());
        let cache = Arc::new(counting_cache(&loader, &counters));
        let key = ResourceKey::path(ContextId(3), "world/shared.blp");
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|_| {
                let (cache, key, barrier) = (cache.clone(), key.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.emplace(&key).unwrap()
                })
            })
            .collect_vec();

        let instances = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect_vec();
        assert!(instances.iter().all(|instance| Arc::ptr_eq(instance, &instances[0])));
        assert_eq!(cache.refcount(&key), Some(THREADS));

        loader.wait_until_idle().unwrap();
        assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contexts_get_their_own_instances() {
        let loader = Arc::new(AsyncLoader::start(1).unwrap());
        let counters = Arc::new(Counters::default());
        let cache = counting_cache(&loader, &counters);

        let a = cache.emplace(&ResourceKey::path(ContextId(0), "tex1")).unwrap();
        let b = cache.emplace(&ResourceKey::path(ContextId(1), "tex1")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);

        let mut visited = Vec::new();
        cache
            .context_aware_apply(ContextId(1), |key, _| visited.push(key.clone()))
            .unwrap();
        assert_eq!(visited, vec![ResourceKey::path(ContextId(1), "tex1")]);

        let mut all = 0;
        cache.apply(|_, _| all += 1).unwrap();
        assert_eq!(all, 2);
    }

    #[test]
    fn visitors_must_not_reenter() {
        let loader = Arc::new(AsyncLoader::start(1).unwrap());
        let counters = Arc::new(Counters::default());
        let cache = counting_cache(&loader, &counters);
        let key = ResourceKey::path(ContextId(0), "tex1");
        cache.emplace(&key).unwrap();

        let mut nested = None;
        cache
            .apply(|key, _| nested = Some(cache.emplace(key)))
            .unwrap();
        assert!(matches!(nested, Some(Err(CacheError::Reentrant { .. }))));
        assert_eq!(cache.refcount(&key), Some(1));

        // The guard is gone once apply returns.
        cache.emplace(&key).unwrap();
        assert_eq!(cache.refcount(&key), Some(2));
    }

    #[test]
    fn erase_waits_for_the_worker_and_allows_a_fresh_instance() {
        let loader = Arc::new(AsyncLoader::start(2).unwrap());
        let counters = Arc::new(Counters::default());
        let (started_tx, started) = channel();
        let (open, gate) = channel();
        let gate = Mutex::new(Some((started_tx, gate)));

        let cache = Arc::new(ResourceCache::new("gated", loader.clone(), {
            let counters = counters.clone();
            move |key: &ResourceKey| CountingAsset {
                name: key.to_string(),
                status: LoadStatus::new(),
                counters: counters.clone(),
                gate: Mutex::new(gate.lock().unwrap().take()),
            }
        }));
        let key = ResourceKey::path(ContextId(0), "slow.blp");

        let old = cache.emplace(&key).unwrap();
        started.recv().unwrap();
        assert!(loader.is_loading(old.as_ref()));

        let eraser = {
            let (cache, key) = (cache.clone(), key.clone());
            std::thread::spawn(move || cache.erase(&key).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!eraser.is_finished());
        assert!(!cache.contains(&key), "no refcount-0 entry is reachable");

        let fresh = cache.emplace(&key).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));

        open.send(()).unwrap();
        assert_eq!(eraser.join().unwrap(), 0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(old.status().state(), LoadState::Ready);
        assert_eq!(cache.refcount(&key), Some(1));
    }
}
