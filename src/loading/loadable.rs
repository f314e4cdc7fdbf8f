use tokio::sync::watch;

use crate::loading::error::LoadError;

/// Queue classes of the [`crate::loading::AsyncLoader`]. A lower class is always drained first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const COUNT: usize = 3;
    pub const ALL: [Priority; Priority::COUNT] = [Priority::High, Priority::Medium, Priority::Low];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// Not handed to a loader yet.
    Constructed,
    Queued,
    Loading,
    Ready,
    Errored,
}

impl LoadState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Ready | LoadState::Errored)
    }
}

/// The load state of a single object, observable (and awaitable) from any thread.
///
/// Transitions only ever move forward: `Constructed -> Queued -> Loading -> Ready | Errored`, where
/// `Errored` can be reached from any non-terminal state. Objects are never reloaded in place, a
/// retry means constructing a new object.
#[derive(Debug)]
pub struct LoadStatus {
    state: watch::Sender<LoadState>,
}

impl Default for LoadStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadStatus {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(LoadState::Constructed),
        }
    }

    #[inline]
    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    pub fn mark_queued(&self) -> bool {
        self.transition(|current| current == LoadState::Constructed, LoadState::Queued)
    }

    pub fn mark_loading(&self) -> bool {
        self.transition(|current| current == LoadState::Queued, LoadState::Loading)
    }

    pub fn mark_ready(&self) -> bool {
        self.transition(|current| current == LoadState::Loading, LoadState::Ready)
    }

    pub fn mark_errored(&self) -> bool {
        self.transition(|current| !current.is_terminal(), LoadState::Errored)
    }

    fn transition(&self, allowed: impl Fn(LoadState) -> bool, next: LoadState) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Blocks the calling thread until the object is `Ready` or `Errored`.
    pub fn wait_until_settled(&self) -> LoadState {
        let mut receiver = self.state.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        pollster::block_on(receiver.wait_for(|state| state.is_terminal()))
            .map(|state| *state)
            .unwrap_or_else(|_| self.state())
    }
}

/// Anything that can be queued on the [`crate::loading::AsyncLoader`] and polled for completion.
///
/// Only the loader calls [`Loadable::begin_load`], and it does so exactly once per object.
/// Renderers and UI only ever read [`Loadable::is_finished`] / [`Loadable::errored`].
pub trait Loadable: Send + Sync {
    fn status(&self) -> &LoadStatus;

    /// The stable name of the object, used for logging and the important-failure report.
    fn identity(&self) -> &str;

    /// The actual (potentially slow) work. Runs on a worker thread, outside any loader lock.
    fn begin_load(&self) -> Result<(), LoadError>;

    fn on_error(&self, _error: &LoadError) {
        self.status().mark_errored();
    }

    /// Whether losing this object would lose data when saving.
    fn is_required_for_save(&self) -> bool {
        false
    }

    fn priority_class(&self) -> Priority {
        Priority::Medium
    }

    fn is_finished(&self) -> bool {
        self.status().state().is_terminal()
    }

    fn errored(&self) -> bool {
        self.status().state() == LoadState::Errored
    }

    /// Blocks until [`Loadable::is_finished`] holds. Objects with children override this to wait for
    /// them as well.
    fn wait_until_finished(&self) {
        self.status().wait_until_settled();
    }

    /// Called by the owning cache after the object was proven deletable, right before it is
    /// dropped from the cache. Objects holding cache references of their own give them back here.
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let status = LoadStatus::new();
        assert_eq!(status.state(), LoadState::Constructed);
        assert!(!status.mark_loading());
        assert!(status.mark_queued());
        assert!(!status.mark_queued());
        assert!(status.mark_loading());
        assert!(status.mark_ready());
        assert!(!status.mark_errored());
        assert_eq!(status.state(), LoadState::Ready);
    }

    #[test]
    fn errored_is_reachable_before_loading() {
        let status = LoadStatus::new();
        assert!(status.mark_queued());
        assert!(status.mark_errored());
        assert!(!status.mark_loading());
        assert_eq!(status.wait_until_settled(), LoadState::Errored);
    }

    #[test]
    fn wait_until_settled_wakes_up_on_another_thread() {
        let status = std::sync::Arc::new(LoadStatus::new());
        status.mark_queued();
        status.mark_loading();

        let waiter = {
            let status = status.clone();
            std::thread::spawn(move || status.wait_until_settled())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        status.mark_ready();
        assert_eq!(waiter.join().expect("waiter thread"), LoadState::Ready);
    }

    #[test]
    fn priorities_are_ordered_by_index() {
        assert!(Priority::High < Priority::Low);
        let indices: Vec<usize> = Priority::ALL.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
