//! Session coordinator.
//!
//! Owns the single named session slot and drives the backend through create, find, join
//! and destroy requests. Every request registers a completion delegate right before it is
//! issued; the delegate is cleared exactly once, either when the request is rejected
//! synchronously, when its completion arrives, or when it is abandoned after a timeout.
//!
//! Creating while a session already occupies the slot destroys it first. The create is
//! stashed and only issued from the destroy completion, so the old session is always torn
//! down before the new one is requested.
//!
//! The state lock is never held across a backend call or an event broadcast. Completions
//! may therefore arrive synchronously, from another thread, or trigger new requests from
//! inside consumer handlers.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
    time::Instant,
};

use tracing::{debug, warn};

use crate::{
    backend::{
        Completion, CompletionDelegate, DelegateHandle, JoinSessionResult, NamedSession,
        OperationKind, SessionBackend, SessionSearchResult, UserId,
    },
    config::SessionConfig,
    events::{FindSessionsComplete, SessionEvents},
    settings::{SearchParameters, SessionSettings},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeferredCreate {
    num_public_connections: u32,
    match_type: String,
}

/// A delegate registered for an in-flight request, tied to the backend it was added on.
struct Subscription {
    backend: Arc<dyn SessionBackend>,
    handle: DelegateHandle,
}

#[derive(Default)]
struct PendingOperation {
    issued_at: Option<Instant>,
    subscription: Option<Subscription>,
}

impl PendingOperation {
    fn is_pending(&self) -> bool {
        self.issued_at.is_some()
    }

    fn finish(&mut self) -> Option<Subscription> {
        let subscription = self.subscription.take()?;
        self.issued_at = None;
        Some(subscription)
    }
}

#[derive(Default)]
struct CoordinatorState {
    pending: HashMap<OperationKind, PendingOperation>,
    deferred_create: Option<DeferredCreate>,
    last_session_settings: Option<SessionSettings>,
    last_search: Option<SearchParameters>,
    last_search_results: Vec<SessionSearchResult>,
}

impl CoordinatorState {
    fn is_pending(&self, kind: OperationKind) -> bool {
        self.pending.get(&kind).is_some_and(PendingOperation::is_pending)
    }
}

enum Submission {
    Accepted,
    Rejected,
}

/// Coordinates the lifecycle of one matchmaking session slot.
pub struct SessionCoordinator {
    this: Weak<SessionCoordinator>,
    local_user: UserId,
    config: SessionConfig,
    backend: RwLock<Option<Arc<dyn SessionBackend>>>,
    state: Mutex<CoordinatorState>,
    events: SessionEvents,
}

impl SessionCoordinator {
    /// Creates a coordinator without a backend. Every request fails until one is set.
    pub fn new(local_user: UserId, config: SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_user,
            config,
            backend: RwLock::new(None),
            state: Mutex::new(CoordinatorState::default()),
            events: SessionEvents::default(),
        })
    }

    pub fn with_backend(
        local_user: UserId,
        config: SessionConfig,
        backend: Arc<dyn SessionBackend>,
    ) -> Arc<Self> {
        let coordinator = Self::new(local_user, config);
        coordinator.set_backend(Some(backend));
        coordinator
    }

    /// Replaces the backend. Requests already in flight keep the backend they were issued on.
    pub fn set_backend(&self, backend: Option<Arc<dyn SessionBackend>>) {
        *self.backend.write().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    pub fn has_backend(&self) -> bool {
        self.backend().is_some()
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Creates the session, destroying the one occupying the slot first if necessary.
    ///
    /// Emits `on_create_complete`. When a destroy is needed, `on_destroy_complete` is
    /// emitted once the old session is gone, after the replacement create was issued.
    /// If the old session cannot be destroyed, `on_create_complete(false)` follows
    /// `on_destroy_complete(false)`.
    pub fn create_session(&self, num_public_connections: u32, match_type: impl Into<String>) {
        let match_type = match_type.into();
        let Some(backend) = self.backend() else {
            warn!("create session failed: no session backend available");
            self.emit_failure(OperationKind::Create);
            return;
        };
        if self.is_pending(OperationKind::Create) {
            self.refuse_duplicate(OperationKind::Create);
            return;
        }

        if let Some(existing) = backend.named_session(&self.config.session_name) {
            let destroy_in_flight = {
                let mut state = self.state();
                state.deferred_create = Some(DeferredCreate {
                    num_public_connections,
                    match_type,
                });
                state.is_pending(OperationKind::Destroy)
            };
            debug!(
                session = %self.config.session_name,
                existing = %existing.session_id,
                "session slot occupied, destroying before create"
            );
            if !destroy_in_flight {
                self.destroy_session();
            }
            return;
        }

        if !self.reserve(OperationKind::Create) {
            return;
        }
        let settings = SessionSettings::advertised_match(
            num_public_connections,
            &match_type,
            backend.is_lan(),
            self.config.build_unique_id,
        );
        self.state().last_session_settings = Some(settings.clone());

        let submission = self.submit(OperationKind::Create, &backend, |backend| {
            backend.create_session(&self.local_user, &self.config.session_name, &settings)
        });
        if let Submission::Rejected = submission {
            warn!(session = %self.config.session_name, "backend rejected create session request");
            self.emit_failure(OperationKind::Create);
        }
    }

    /// Searches presence sessions. Emits `on_find_complete`; an empty result set is a failure.
    pub fn find_sessions(&self, max_results: u32) {
        let Some(backend) = self.backend() else {
            warn!("find sessions failed: no session backend available");
            self.emit_failure(OperationKind::Find);
            return;
        };
        if !self.reserve(OperationKind::Find) {
            return;
        }
        let search = SearchParameters::presence(max_results, backend.is_lan());
        {
            let mut state = self.state();
            state.last_search = Some(search);
            state.last_search_results.clear();
        }

        let submission = self.submit(OperationKind::Find, &backend, |backend| {
            backend.find_sessions(&self.local_user, &search)
        });
        if let Submission::Rejected = submission {
            warn!(max_results, "backend rejected find sessions request");
            self.emit_failure(OperationKind::Find);
        }
    }

    /// Joins `result` under the configured session name. Emits `on_join_complete`.
    pub fn join_session(&self, result: &SessionSearchResult) {
        let Some(backend) = self.backend() else {
            warn!("join session failed: no session backend available");
            self.emit_failure(OperationKind::Join);
            return;
        };
        if !self.reserve(OperationKind::Join) {
            return;
        }

        let submission = self.submit(OperationKind::Join, &backend, |backend| {
            backend.join_session(&self.local_user, &self.config.session_name, result)
        });
        if let Submission::Rejected = submission {
            warn!(session_id = %result.session_id, "backend rejected join session request");
            self.emit_failure(OperationKind::Join);
        }
    }

    /// Destroys the session in the slot. Emits `on_destroy_complete`.
    pub fn destroy_session(&self) {
        let Some(backend) = self.backend() else {
            warn!("destroy session failed: no session backend available");
            self.fail_destroy();
            return;
        };
        if !self.reserve(OperationKind::Destroy) {
            return;
        }

        let submission = self.submit(OperationKind::Destroy, &backend, |backend| {
            backend.destroy_session(&self.config.session_name)
        });
        if let Submission::Rejected = submission {
            warn!(session = %self.config.session_name, "backend rejected destroy session request");
            self.fail_destroy();
        }
    }

    /// No backend operation is bound to starting a session; nothing is requested or emitted.
    pub fn start_session(&self) {
        debug!(session = %self.config.session_name, "start session requested, nothing to do");
    }

    /// Address of the joined session, resolved by the backend.
    pub fn connect_string(&self) -> Option<String> {
        self.backend()?
            .resolved_connect_string(&self.config.session_name)
    }

    pub fn existing_session(&self) -> Option<NamedSession> {
        self.backend()?.named_session(&self.config.session_name)
    }

    pub fn is_pending(&self, kind: OperationKind) -> bool {
        self.state().is_pending(kind)
    }

    pub fn pending_kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self
            .state()
            .pending
            .iter()
            .filter(|(_, pending)| pending.is_pending())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Whether a create is waiting for the current session to be destroyed.
    pub fn has_deferred_create(&self) -> bool {
        self.state().deferred_create.is_some()
    }

    pub fn last_session_settings(&self) -> Option<SessionSettings> {
        self.state().last_session_settings.clone()
    }

    pub fn last_search(&self) -> Option<SearchParameters> {
        self.state().last_search
    }

    pub fn last_search_results(&self) -> Vec<SessionSearchResult> {
        self.state().last_search_results.clone()
    }

    /// Abandons every request pending for longer than the configured timeout.
    ///
    /// Abandoned requests have their delegate cleared and their failure event emitted. An
    /// abandoned destroy also fails the deferred create. Returns the abandoned kinds.
    pub fn expire_stale_requests(&self, now: Instant) -> Vec<OperationKind> {
        let Some(timeout) = self.config.request_timeout() else {
            return Vec::new();
        };

        let (mut expired, dropped_create) = {
            let mut state = self.state();
            let mut expired = Vec::new();
            for (kind, pending) in state.pending.iter_mut() {
                let stale = pending
                    .issued_at
                    .is_some_and(|issued| now.saturating_duration_since(issued) >= timeout);
                if stale {
                    if let Some(subscription) = pending.finish() {
                        expired.push((*kind, subscription));
                    }
                }
            }
            let dropped_create = expired.iter().any(|(kind, _)| *kind == OperationKind::Destroy)
                && state.deferred_create.take().is_some();
            (expired, dropped_create)
        };
        expired.sort_by_key(|(kind, _)| *kind);

        let mut kinds = Vec::with_capacity(expired.len());
        for (kind, subscription) in expired {
            subscription
                .backend
                .clear_completion_delegate(kind, subscription.handle);
            warn!(%kind, ?timeout, "abandoning session request after timeout");
            self.emit_failure(kind);
            kinds.push(kind);
        }
        if dropped_create {
            debug!("dropping deferred create, destroy expired");
            self.emit_failure(OperationKind::Create);
        }
        kinds
    }

    fn handle_completion(&self, completion: &Completion) {
        if let Some(session_name) = completion.session_name() {
            if session_name != self.config.session_name {
                debug!(
                    kind = %completion.kind(),
                    session_name,
                    "ignoring completion for another session"
                );
                return;
            }
        }
        match completion {
            Completion::Create { successful, .. } => {
                if !self.settle(OperationKind::Create) {
                    return;
                }
                debug!(successful, "create session complete");
                self.events.on_create_complete.broadcast(successful);
            }
            Completion::Find {
                successful,
                results,
            } => {
                if !self.settle(OperationKind::Find) {
                    return;
                }
                let outcome = if results.is_empty() {
                    FindSessionsComplete::failed()
                } else {
                    FindSessionsComplete {
                        results: results.clone(),
                        successful: *successful,
                    }
                };
                self.state().last_search_results = outcome.results.clone();
                debug!(
                    found = outcome.results.len(),
                    successful = outcome.successful,
                    "find sessions complete"
                );
                self.events.on_find_complete.broadcast(&outcome);
            }
            Completion::Join { result, .. } => {
                if !self.settle(OperationKind::Join) {
                    return;
                }
                debug!(%result, "join session complete");
                self.events.on_join_complete.broadcast(result);
            }
            Completion::Destroy { successful, .. } => {
                if !self.settle(OperationKind::Destroy) {
                    return;
                }
                debug!(successful, "destroy session complete");
                let deferred = self.state().deferred_create.take();
                let dropped_create = match deferred {
                    Some(create) if *successful => {
                        debug!(
                            num_public_connections = create.num_public_connections,
                            match_type = %create.match_type,
                            "resuming deferred create"
                        );
                        self.create_session(create.num_public_connections, create.match_type);
                        false
                    }
                    Some(_) => {
                        warn!("destroy failed, dropping deferred create");
                        true
                    }
                    None => false,
                };
                self.events.on_destroy_complete.broadcast(successful);
                if dropped_create {
                    self.emit_failure(OperationKind::Create);
                }
            }
            Completion::Start { .. } => {
                debug!("ignoring start session completion");
            }
        }
    }

    /// Reports a destroy that will never complete, then the create stashed behind it.
    fn fail_destroy(&self) {
        let dropped_create = self.state().deferred_create.take().is_some();
        self.emit_failure(OperationKind::Destroy);
        if dropped_create {
            debug!("dropping deferred create, destroy was not issued");
            self.emit_failure(OperationKind::Create);
        }
    }

    /// Marks `kind` as in flight. Refuses (and reports the failure) if it already is.
    fn reserve(&self, kind: OperationKind) -> bool {
        let refused = {
            let mut state = self.state();
            let pending = state.pending.entry(kind).or_default();
            if pending.is_pending() {
                true
            } else {
                pending.issued_at = Some(Instant::now());
                false
            }
        };
        if refused {
            self.refuse_duplicate(kind);
            return false;
        }
        true
    }

    fn refuse_duplicate(&self, kind: OperationKind) {
        warn!(%kind, "request refused, previous request of this kind still pending");
        self.emit_failure(kind);
    }

    /// Registers the completion delegate for `kind`, then issues the request.
    fn submit(
        &self,
        kind: OperationKind,
        backend: &Arc<dyn SessionBackend>,
        request: impl FnOnce(&dyn SessionBackend) -> bool,
    ) -> Submission {
        let handle = backend.add_completion_delegate(kind, self.completion_delegate());
        {
            let mut state = self.state();
            let pending = state.pending.entry(kind).or_default();
            pending.issued_at.get_or_insert_with(Instant::now);
            pending.subscription = Some(Subscription {
                backend: Arc::clone(backend),
                handle,
            });
        }

        if request(backend.as_ref()) {
            debug!(%kind, "session request accepted");
            return Submission::Accepted;
        }
        match self.take_subscription(kind) {
            Some(subscription) => {
                subscription
                    .backend
                    .clear_completion_delegate(kind, subscription.handle);
                Submission::Rejected
            }
            // A completion delivered inside the request call already reported the outcome.
            None => Submission::Accepted,
        }
    }

    /// Clears the delegate of the request a completion belongs to.
    fn settle(&self, kind: OperationKind) -> bool {
        match self.take_subscription(kind) {
            Some(subscription) => {
                subscription
                    .backend
                    .clear_completion_delegate(kind, subscription.handle);
                true
            }
            None => {
                debug!(%kind, "ignoring completion without a pending request");
                false
            }
        }
    }

    fn take_subscription(&self, kind: OperationKind) -> Option<Subscription> {
        self.state()
            .pending
            .get_mut(&kind)
            .and_then(PendingOperation::finish)
    }

    fn completion_delegate(&self) -> CompletionDelegate {
        let this = self.this.clone();
        Arc::new(move |completion: &Completion| {
            if let Some(coordinator) = this.upgrade() {
                coordinator.handle_completion(completion);
            }
        })
    }

    fn emit_failure(&self, kind: OperationKind) {
        match kind {
            OperationKind::Create => self.events.on_create_complete.broadcast(&false),
            OperationKind::Find => self
                .events
                .on_find_complete
                .broadcast(&FindSessionsComplete::failed()),
            OperationKind::Join => self
                .events
                .on_join_complete
                .broadcast(&JoinSessionResult::UnknownError),
            OperationKind::Destroy => self.events.on_destroy_complete.broadcast(&false),
            OperationKind::Start => {}
        }
    }

    fn backend(&self) -> Option<Arc<dyn SessionBackend>> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("local_user", &self.local_user)
            .field("session_name", &self.config.session_name)
            .field("has_backend", &self.has_backend())
            .field("pending", &self.pending_kinds())
            .finish()
    }
}

impl Drop for SessionCoordinator {
    /// Clears the delegates of requests still in flight; their completions have nowhere to go.
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (kind, pending) in state.pending.iter_mut() {
            if let Some(subscription) = pending.finish() {
                debug!(%kind, "clearing delegate of abandoned request");
                subscription
                    .backend
                    .clear_completion_delegate(*kind, subscription.handle);
            }
        }
    }
}
