//! Multicast completion events.
//!
//! Each event is an ordered list of handlers. Broadcasting invokes a snapshot of the list,
//! so handlers may register or remove handlers (or call back into the coordinator) while
//! the event is being delivered. Such changes apply from the next broadcast.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::backend::{JoinSessionResult, SessionSearchResult};

/// Registration id returned by [`MulticastEvent::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct MulticastEvent<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
}

impl<T> MulticastEvent<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if no handler with `id` was registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast(&self, args: &T) {
        let snapshot: Vec<Handler<T>> = self
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(HandlerId, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for MulticastEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MulticastEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastEvent")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Payload of the find-complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindSessionsComplete {
    pub results: Vec<SessionSearchResult>,
    pub successful: bool,
}

impl FindSessionsComplete {
    pub fn failed() -> Self {
        Self {
            results: Vec::new(),
            successful: false,
        }
    }
}

/// Events the coordinator re-broadcasts to its consumers.
#[derive(Debug, Default)]
pub struct SessionEvents {
    pub on_create_complete: MulticastEvent<bool>,
    pub on_find_complete: MulticastEvent<FindSessionsComplete>,
    pub on_join_complete: MulticastEvent<JoinSessionResult>,
    pub on_destroy_complete: MulticastEvent<bool>,
    /// Declared for symmetry; the coordinator never emits it.
    pub on_start_complete: MulticastEvent<bool>,
}
