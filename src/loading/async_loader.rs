use std::any::Any;
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, trace, warn};
use tokio::sync::watch;

use crate::loading::error::LoadError;
use crate::loading::loadable::{Loadable, Priority};

thread_local! {
    static IS_LOADER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Objects are tracked by the address of their data, which is stable while the loader holds them.
#[inline]
fn handle_id<T: ?Sized>(object: &T) -> usize {
    object as *const T as *const () as usize
}

#[derive(Default)]
struct LoaderState {
    queues: [VecDeque<Arc<dyn Loadable>>; Priority::COUNT],
    queued: HashSet<usize>,
    /// Completion signals of the objects a worker currently holds.
    loading: HashMap<usize, watch::Receiver<bool>>,
    stop: bool,
}

impl LoaderState {
    fn has_work(&self) -> bool {
        self.queues.iter().any(|queue| !queue.is_empty())
    }

    fn is_idle(&self) -> bool {
        !self.has_work() && self.loading.is_empty()
    }

    fn pop_next(&mut self) -> Option<Arc<dyn Loadable>> {
        let object = self.queues.iter_mut().find_map(|queue| queue.pop_front())?;
        self.queued.remove(&handle_id(object.as_ref()));
        Some(object)
    }

    fn remove_queued(&mut self, id: usize) -> Option<Arc<dyn Loadable>> {
        if !self.queued.remove(&id) {
            return None;
        }

        self.queues.iter_mut().find_map(|queue| {
            let position = queue
                .iter()
                .position(|object| handle_id(object.as_ref()) == id)?;
            queue.remove(position)
        })
    }
}

struct LoaderShared {
    state: Mutex<LoaderState>,
    work_available: Condvar,
    /// Signalled whenever a worker finished an object, used by [`AsyncLoader::wait_until_idle`].
    job_finished: Condvar,
    important_failed: AtomicBool,
    important_failures: Mutex<Vec<String>>,
}

/// A fixed-size pool of worker threads draining priority-ordered queues of [`Loadable`]s.
///
/// The loader is the only code path that calls [`Loadable::begin_load`]. Owners that want to drop an
/// object must call [`AsyncLoader::ensure_deletable`] first, which either pulls the object out of
/// its queue or blocks until the worker that picked it up is done with it.
pub struct AsyncLoader {
    shared: Arc<LoaderShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl AsyncLoader {
    /// Spawns `max(1, thread_count)` workers.
    pub fn start(thread_count: usize) -> std::io::Result<Self> {
        let worker_count = thread_count.max(1);
        let shared = Arc::new(LoaderShared {
            state: Mutex::new(LoaderState::default()),
            work_available: Condvar::new(),
            job_finished: Condvar::new(),
            important_failed: AtomicBool::new(false),
            important_failures: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("AsyncLoader #{}", index))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        debug!("Started the async loader with {} workers", worker_count);
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Whether the calling thread is one of the loader's workers (of any loader).
    pub fn is_loader_thread() -> bool {
        IS_LOADER_THREAD.with(|flag| flag.get())
    }

    /// Queues the object at its own [`Loadable::priority_class`].
    pub fn submit(&self, object: Arc<dyn Loadable>) -> bool {
        let priority = object.priority_class();
        self.submit_with_priority(object, priority)
    }

    /// Appends the object to the queue of the given class and wakes one worker.
    ///
    /// Returns `false` without doing anything if the object is already queued or loading, or if
    /// the loader has been shut down.
    pub fn submit_with_priority(&self, object: Arc<dyn Loadable>, priority: Priority) -> bool {
        let id = handle_id(object.as_ref());
        {
            let mut state = self.shared.state.lock().expect("Loader State Lock");
            if state.stop {
                warn!(
                    "Rejecting {}, the loader has already been shut down",
                    object.identity()
                );
                return false;
            }

            if state.queued.contains(&id) || state.loading.contains_key(&id) {
                trace!("{} is already queued or loading", object.identity());
                return false;
            }

            object.status().mark_queued();
            state.queued.insert(id);
            state.queues[priority.index()].push_back(object);
        }

        self.shared.work_available.notify_one();
        true
    }

    /// Guarantees that no worker touches the object once this returns.
    ///
    /// An object still waiting in a queue is removed from it and ends up `Errored`. An object
    /// that a worker already picked up cannot be interrupted, so this blocks until the worker has
    /// finished with it, successfully or not.
    pub fn ensure_deletable<T: Loadable + ?Sized>(&self, object: &T) {
        let id = handle_id(object);
        let mut completion = {
            let mut state = self.shared.state.lock().expect("Loader State Lock");
            if let Some(cancelled) = state.remove_queued(id) {
                drop(state);
                trace!("Cancelled {} before it was picked up", cancelled.identity());
                // It will never load, so nobody may wait for it.
                cancelled.status().mark_errored();
                return;
            }

            match state.loading.get(&id) {
                Some(completion) => completion.clone(),
                None => return,
            }
        };

        trace!("Waiting for the in-flight load of {}", object.identity());
        // A closed channel means the worker is gone, which is just as good as done.
        let _ = pollster::block_on(completion.wait_for(|done| *done));
    }

    pub fn is_loading<T: Loadable + ?Sized>(&self, object: &T) -> bool {
        let state = self.shared.state.lock().expect("Loader State Lock");
        state.loading.contains_key(&handle_id(object))
    }

    pub fn is_queued<T: Loadable + ?Sized>(&self, object: &T) -> bool {
        let state = self.shared.state.lock().expect("Loader State Lock");
        state.queued.contains(&handle_id(object))
    }

    pub fn queued_len(&self) -> usize {
        let state = self.shared.state.lock().expect("Loader State Lock");
        state.queued.len()
    }

    /// Blocks until every queue is empty and no worker holds an object. Loads that submit further
    /// work (children) do so before they finish, so this also waits for the fan-out.
    pub fn wait_until_idle(&self) -> Result<(), LoadError> {
        if Self::is_loader_thread() {
            return Err(LoadError::WouldDeadlock {
                identity: "the async loader".into(),
            });
        }

        let state = self.shared.state.lock().expect("Loader State Lock");
        let _state = self
            .shared
            .job_finished
            .wait_while(state, |state| !state.stop && !state.is_idle())
            .expect("Loader State Lock");
        Ok(())
    }

    /// The process-wide signal that the save path has to consult before persisting anything.
    pub fn has_important_failure(&self) -> bool {
        self.shared.important_failed.load(Ordering::SeqCst)
    }

    pub fn important_failures(&self) -> Vec<String> {
        self.shared
            .important_failures
            .lock()
            .expect("Important Failures Lock")
            .clone()
    }

    pub fn check_important_failures(&self) -> Result<(), LoadError> {
        if !self.has_important_failure() {
            return Ok(());
        }

        Err(LoadError::CriticalAssetMissing {
            identities: self.important_failures(),
        })
    }

    /// Clears the important-failure signal after the user has been told about it.
    pub fn acknowledge_important_failures(&self) -> Vec<String> {
        let mut failures = self
            .shared
            .important_failures
            .lock()
            .expect("Important Failures Lock");
        self.shared.important_failed.store(false, Ordering::SeqCst);
        std::mem::take(&mut *failures)
    }

    /// Stops accepting work, lets every worker finish its current object and joins them.
    /// Objects still sitting in a queue are never loaded and end up `Errored`.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock().expect("Loader State Lock");
            if state.stop {
                return;
            }

            state.stop = true;
            state.queued.clear();
            state
                .queues
                .iter_mut()
                .flat_map(|queue| queue.drain(..))
                .collect::<Vec<_>>()
        };

        if !discarded.is_empty() {
            debug!(
                "Shutting down with {} objects still queued",
                discarded.len()
            );
        }
        for object in discarded {
            object.status().mark_errored();
        }

        self.shared.work_available.notify_all();
        self.shared.job_finished.notify_all();

        if Self::is_loader_thread() {
            warn!("AsyncLoader::shutdown called from a worker, not joining the pool");
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock().expect("Loader Workers Lock"));
        for worker in workers {
            if worker.join().is_err() {
                error!("An async loader worker terminated abnormally");
            }
        }
        debug!("Async loader has been shut down");
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<LoaderShared>) {
    IS_LOADER_THREAD.with(|flag| flag.set(true));

    loop {
        let (object, completion) = {
            let state = shared.state.lock().expect("Loader State Lock");
            let mut state = shared
                .work_available
                .wait_while(state, |state| !state.stop && !state.has_work())
                .expect("Loader State Lock");

            if state.stop {
                break;
            }

            let Some(object) = state.pop_next() else {
                continue;
            };

            let (completion, receiver) = watch::channel(false);
            state.loading.insert(handle_id(object.as_ref()), receiver);
            object.status().mark_loading();
            (object, completion)
        };

        process(&shared, object.as_ref());

        {
            let mut state = shared.state.lock().expect("Loader State Lock");
            state.loading.remove(&handle_id(object.as_ref()));
        }
        completion.send_replace(true);
        shared.job_finished.notify_all();
    }

    trace!("Async loader worker exiting");
}

fn process(shared: &LoaderShared, object: &dyn Loadable) {
    profiling::scope!("AsyncLoader::process");
    trace!("Loading {}", object.identity());

    let result = match panic::catch_unwind(AssertUnwindSafe(|| object.begin_load())) {
        Ok(result) => result,
        Err(payload) => Err(LoadError::Panicked {
            identity: object.identity().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    };

    let error = match result {
        Ok(()) => {
            object.status().mark_ready();
            return;
        }
        Err(error) => error,
    };

    // Raised before the object settles, so whoever waits for it already sees the signal.
    if object.is_required_for_save() {
        error!(
            "{} is required for saving and failed to load, saving is blocked",
            object.identity()
        );
        shared
            .important_failures
            .lock()
            .expect("Important Failures Lock")
            .push(object.identity().to_string());
        shared.important_failed.store(true, Ordering::SeqCst);
    }

    object.on_error(&error);

    let recoverable = matches!(error, LoadError::Decode { .. });
    let error = anyhow::Error::new(error);
    if recoverable {
        warn!("{:#}", error);
    } else {
        error!("{:#}", error);
    }

    // on_error may be overridden, the object has to settle regardless.
    object.status().mark_errored();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
