//! In-memory [`SessionBackend`].
//!
//! Requests are simulated against a shared [`LoopbackNetwork`]. Completions are either
//! delivered synchronously from inside the request call or queued until [`pump`] runs,
//! which mirrors how online services run their callbacks from a polling loop.
//!
//! Tests can arm a synchronous rejection with [`reject_next`] or override the outcome of
//! the next request with [`script_next`], and inspect delegate bookkeeping afterwards.
//!
//! [`pump`]: LoopbackSessionBackend::pump
//! [`reject_next`]: LoopbackSessionBackend::reject_next
//! [`script_next`]: LoopbackSessionBackend::script_next

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use multiplayer_sessions::{
    Completion, CompletionDelegate, DelegateHandle, DelegateRegistry, JoinSessionResult,
    NamedSession, OperationKind, SearchParameters, SessionBackend, SessionSearchResult,
    SessionSettings, UserId, NULL_SUBSYSTEM,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{error::LoopbackError, network::LoopbackNetwork};

/// When completions reach the registered delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Inside the request call, before it returns.
    Immediate,
    /// On the next [`LoopbackSessionBackend::pump`].
    #[default]
    Queued,
}

/// A request the backend accepted or rejected, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    Create {
        requester: UserId,
        session_name: String,
        settings: SessionSettings,
    },
    Find {
        requester: UserId,
        search: SearchParameters,
    },
    Join {
        requester: UserId,
        session_name: String,
        session_id: String,
    },
    Destroy {
        session_name: String,
    },
}

impl BackendRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            BackendRequest::Create { .. } => OperationKind::Create,
            BackendRequest::Find { .. } => OperationKind::Find,
            BackendRequest::Join { .. } => OperationKind::Join,
            BackendRequest::Destroy { .. } => OperationKind::Destroy,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DelegateCounts {
    added: usize,
    cleared: usize,
    /// Clears for handles that were not registered.
    stale: usize,
}

#[derive(Debug)]
struct LocalSession {
    named: NamedSession,
    connect_string: String,
}

#[derive(Debug, Default)]
struct BackendState {
    sessions: BTreeMap<String, LocalSession>,
    queued: VecDeque<Completion>,
    rejections: HashMap<OperationKind, usize>,
    scripted: HashMap<OperationKind, VecDeque<Completion>>,
    requests: Vec<BackendRequest>,
    counts: HashMap<OperationKind, DelegateCounts>,
}

enum Gate {
    Rejected,
    Scripted(Completion),
    Simulate,
}

pub struct LoopbackSessionBackend {
    network: LoopbackNetwork,
    user: UserId,
    address: String,
    mode: DeliveryMode,
    delegates: DelegateRegistry,
    state: Mutex<BackendState>,
}

impl LoopbackSessionBackend {
    /// Backend for `user`, reachable by joining players at `address`.
    pub fn new(
        network: LoopbackNetwork,
        user: UserId,
        address: impl Into<String>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            network,
            user,
            address: address.into(),
            mode,
            delegates: DelegateRegistry::new(),
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Delivers every queued completion in order and returns how many were delivered.
    ///
    /// Completions queued by delegates while pumping wait for the next call.
    pub fn pump(&self) -> usize {
        let drained = std::mem::take(&mut self.lock().queued);
        let delivered = drained.len();
        for completion in drained {
            trace!(kind = %completion.kind(), "delivering queued completion");
            self.delegates.broadcast(&completion);
        }
        delivered
    }

    pub fn pending_completions(&self) -> usize {
        self.lock().queued.len()
    }

    /// The next request of `kind` returns `false` without any completion.
    pub fn reject_next(&self, kind: OperationKind) {
        *self.lock().rejections.entry(kind).or_default() += 1;
    }

    /// The next request of the completion's kind is accepted and answered with
    /// `completion` instead of being simulated.
    pub fn script_next(&self, completion: Completion) {
        self.lock()
            .scripted
            .entry(completion.kind())
            .or_default()
            .push_back(completion);
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.lock().requests.clone()
    }

    pub fn request_kinds(&self) -> Vec<OperationKind> {
        self.lock().requests.iter().map(BackendRequest::kind).collect()
    }

    pub fn subscribe_count(&self, kind: OperationKind) -> usize {
        self.counts(kind).added
    }

    pub fn unsubscribe_count(&self, kind: OperationKind) -> usize {
        self.counts(kind).cleared
    }

    /// Clears of handles that were never registered or were already cleared.
    pub fn stale_unsubscribe_count(&self, kind: OperationKind) -> usize {
        self.counts(kind).stale
    }

    pub fn active_delegates(&self, kind: OperationKind) -> usize {
        self.delegates.len(kind)
    }

    fn counts(&self, kind: OperationKind) -> DelegateCounts {
        self.lock().counts.get(&kind).copied().unwrap_or_default()
    }

    fn gate(&self, request: BackendRequest) -> Gate {
        let kind = request.kind();
        let mut state = self.lock();
        state.requests.push(request);
        if let Some(remaining) = state.rejections.get_mut(&kind).filter(|n| **n > 0) {
            *remaining -= 1;
            debug!(%kind, "rejecting loopback request");
            return Gate::Rejected;
        }
        match state.scripted.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(completion) => Gate::Scripted(completion),
            None => Gate::Simulate,
        }
    }

    fn deliver(&self, completion: Completion) {
        match self.mode {
            DeliveryMode::Immediate => self.delegates.broadcast(&completion),
            DeliveryMode::Queued => self.lock().queued.push_back(completion),
        }
    }

    fn host(
        &self,
        session_name: &str,
        settings: &SessionSettings,
    ) -> Result<String, LoopbackError> {
        let mut state = self.lock();
        if state.sessions.contains_key(session_name) {
            return Err(LoopbackError::SessionExists(session_name.to_owned()));
        }
        let session_id = Uuid::new_v4().to_string();
        if settings.should_advertise {
            self.network
                .advertise(&session_id, &self.user, &self.address, settings);
        }
        state.sessions.insert(
            session_name.to_owned(),
            LocalSession {
                named: NamedSession {
                    session_name: session_name.to_owned(),
                    session_id: session_id.clone(),
                    owning_user: self.user.clone(),
                    settings: settings.clone(),
                    hosting: true,
                },
                connect_string: self.address.clone(),
            },
        );
        Ok(session_id)
    }

    fn enter(
        &self,
        requester: &UserId,
        session_name: &str,
        result: &SessionSearchResult,
    ) -> Result<(), LoopbackError> {
        let mut state = self.lock();
        if state.sessions.contains_key(session_name) {
            return Err(LoopbackError::AlreadyInSession(session_name.to_owned()));
        }
        let admission = self.network.admit(&result.session_id, requester)?;
        state.sessions.insert(
            session_name.to_owned(),
            LocalSession {
                named: NamedSession {
                    session_name: session_name.to_owned(),
                    session_id: result.session_id.clone(),
                    owning_user: admission.host,
                    settings: admission.settings,
                    hosting: false,
                },
                connect_string: admission.host_address,
            },
        );
        Ok(())
    }

    fn leave(&self, session_name: &str) -> Result<(), LoopbackError> {
        let local = self
            .lock()
            .sessions
            .remove(session_name)
            .ok_or_else(|| LoopbackError::NoNamedSession(session_name.to_owned()))?;
        if local.named.hosting {
            self.network.withdraw(&local.named.session_id);
        } else {
            self.network.release(&local.named.session_id, &self.user);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionBackend for LoopbackSessionBackend {
    fn subsystem_name(&self) -> &str {
        NULL_SUBSYSTEM
    }

    fn add_completion_delegate(
        &self,
        kind: OperationKind,
        delegate: CompletionDelegate,
    ) -> DelegateHandle {
        self.lock().counts.entry(kind).or_default().added += 1;
        self.delegates.add(kind, delegate)
    }

    fn clear_completion_delegate(&self, kind: OperationKind, handle: DelegateHandle) {
        let cleared = self.delegates.clear(kind, handle);
        let mut state = self.lock();
        let counts = state.counts.entry(kind).or_default();
        if cleared {
            counts.cleared += 1;
        } else {
            counts.stale += 1;
            warn!(%kind, handle = handle.raw(), "cleared unknown completion delegate");
        }
    }

    fn create_session(
        &self,
        requester: &UserId,
        session_name: &str,
        settings: &SessionSettings,
    ) -> bool {
        let request = BackendRequest::Create {
            requester: requester.clone(),
            session_name: session_name.to_owned(),
            settings: settings.clone(),
        };
        let completion = match self.gate(request) {
            Gate::Rejected => return false,
            Gate::Scripted(completion) => completion,
            Gate::Simulate => {
                let successful = match self.host(session_name, settings) {
                    Ok(session_id) => {
                        debug!(session_name, %session_id, "loopback session created");
                        true
                    }
                    Err(err) => {
                        debug!(%err, "loopback create failed");
                        false
                    }
                };
                Completion::Create {
                    session_name: session_name.to_owned(),
                    successful,
                }
            }
        };
        self.deliver(completion);
        true
    }

    fn find_sessions(&self, requester: &UserId, search: &SearchParameters) -> bool {
        let request = BackendRequest::Find {
            requester: requester.clone(),
            search: *search,
        };
        let completion = match self.gate(request) {
            Gate::Rejected => return false,
            Gate::Scripted(completion) => completion,
            Gate::Simulate => {
                let results = self.network.search(requester, search);
                debug!(found = results.len(), "loopback search finished");
                Completion::Find {
                    successful: true,
                    results,
                }
            }
        };
        self.deliver(completion);
        true
    }

    fn join_session(
        &self,
        requester: &UserId,
        session_name: &str,
        result: &SessionSearchResult,
    ) -> bool {
        let request = BackendRequest::Join {
            requester: requester.clone(),
            session_name: session_name.to_owned(),
            session_id: result.session_id.clone(),
        };
        let completion = match self.gate(request) {
            Gate::Rejected => return false,
            Gate::Scripted(completion) => completion,
            Gate::Simulate => {
                let outcome = match self.enter(requester, session_name, result) {
                    Ok(()) => JoinSessionResult::Success,
                    Err(err) => {
                        debug!(%err, "loopback join failed");
                        err.into()
                    }
                };
                Completion::Join {
                    session_name: session_name.to_owned(),
                    result: outcome,
                }
            }
        };
        self.deliver(completion);
        true
    }

    fn destroy_session(&self, session_name: &str) -> bool {
        let request = BackendRequest::Destroy {
            session_name: session_name.to_owned(),
        };
        let completion = match self.gate(request) {
            Gate::Rejected => return false,
            Gate::Scripted(completion) => completion,
            Gate::Simulate => {
                let successful = match self.leave(session_name) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(%err, "loopback destroy failed");
                        false
                    }
                };
                Completion::Destroy {
                    session_name: session_name.to_owned(),
                    successful,
                }
            }
        };
        self.deliver(completion);
        true
    }

    fn named_session(&self, session_name: &str) -> Option<NamedSession> {
        self.lock()
            .sessions
            .get(session_name)
            .map(|local| local.named.clone())
    }

    fn resolved_connect_string(&self, session_name: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(session_name)
            .map(|local| local.connect_string.clone())
    }
}

impl fmt::Debug for LoopbackSessionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackSessionBackend")
            .field("user", &self.user)
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("delegates", &self.delegates)
            .finish_non_exhaustive()
    }
}
