//! Boundary to the online service that actually hosts sessions.
//!
//! The coordinator only talks to a [`SessionBackend`]. Requests are fire-and-forget:
//! each call returns whether the backend accepted it, and the outcome arrives later as a
//! [`Completion`] on every delegate registered for that [`OperationKind`]. Completions may
//! be delivered from any thread, including synchronously from inside the request call.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::settings::{SearchParameters, SessionSettings};

/// Well-known name of the single session slot managed by a coordinator.
pub const SESSION_NAME_GAME: &str = "GameSession";

/// Subsystem name of the local/offline pseudo-backend. Sessions on it are LAN matches.
pub const NULL_SUBSYSTEM: &str = "NULL";

/// Settings key holding the application-defined match type.
pub const SETTING_MATCH_TYPE: &str = "MatchType";

/// Identity of a player as known to the online service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration token of a completion delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelegateHandle(u64);

impl DelegateHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Kinds of session requests. Each kind has its own delegate list on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum OperationKind {
    Create,
    Find,
    Join,
    Destroy,
    Start,
}

/// Outcome of a join request, passed through to consumers unmodified.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum JoinSessionResult {
    Success,
    AlreadyInSession,
    SessionIsFull,
    SessionDoesNotExist,
    CouldNotRetrieveAddress,
    UnknownError,
}

impl JoinSessionResult {
    pub const fn is_success(self) -> bool {
        matches!(self, JoinSessionResult::Success)
    }
}

/// A session currently occupying a name on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSession {
    pub session_name: String,
    pub session_id: String,
    pub owning_user: UserId,
    pub settings: SessionSettings,
    /// `true` when the local player created this session, `false` when it was joined.
    pub hosting: bool,
}

/// One entry of a completed session search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSearchResult {
    pub session_id: String,
    pub owning_user_name: String,
    pub owning_user: UserId,
    pub open_public_connections: u32,
    pub max_public_connections: u32,
    pub ping_ms: Option<u32>,
    pub settings: BTreeMap<String, String>,
}

impl SessionSearchResult {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn match_type(&self) -> Option<&str> {
        self.setting(SETTING_MATCH_TYPE)
    }
}

/// Completion notification delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Create {
        session_name: String,
        successful: bool,
    },
    Find {
        successful: bool,
        results: Vec<SessionSearchResult>,
    },
    Join {
        session_name: String,
        result: JoinSessionResult,
    },
    Destroy {
        session_name: String,
        successful: bool,
    },
    Start {
        session_name: String,
        successful: bool,
    },
}

impl Completion {
    pub fn kind(&self) -> OperationKind {
        match self {
            Completion::Create { .. } => OperationKind::Create,
            Completion::Find { .. } => OperationKind::Find,
            Completion::Join { .. } => OperationKind::Join,
            Completion::Destroy { .. } => OperationKind::Destroy,
            Completion::Start { .. } => OperationKind::Start,
        }
    }

    /// Named session the completion belongs to. Searches are not tied to a name.
    pub fn session_name(&self) -> Option<&str> {
        match self {
            Completion::Create { session_name, .. }
            | Completion::Join { session_name, .. }
            | Completion::Destroy { session_name, .. }
            | Completion::Start { session_name, .. } => Some(session_name.as_str()),
            Completion::Find { .. } => None,
        }
    }
}

/// Callback invoked for every completion of the kind it was registered for.
pub type CompletionDelegate = Arc<dyn Fn(&Completion) + Send + Sync>;

/// Online session capability consumed by the coordinator.
pub trait SessionBackend: Send + Sync {
    /// Name of the online subsystem backing this capability.
    fn subsystem_name(&self) -> &str;

    /// Whether sessions on this backend are LAN matches.
    fn is_lan(&self) -> bool {
        self.subsystem_name() == NULL_SUBSYSTEM
    }

    fn add_completion_delegate(
        &self,
        kind: OperationKind,
        delegate: CompletionDelegate,
    ) -> DelegateHandle;

    fn clear_completion_delegate(&self, kind: OperationKind, handle: DelegateHandle);

    fn create_session(
        &self,
        requester: &UserId,
        session_name: &str,
        settings: &SessionSettings,
    ) -> bool;

    fn find_sessions(&self, requester: &UserId, search: &SearchParameters) -> bool;

    fn join_session(
        &self,
        requester: &UserId,
        session_name: &str,
        result: &SessionSearchResult,
    ) -> bool;

    fn destroy_session(&self, session_name: &str) -> bool;

    fn named_session(&self, session_name: &str) -> Option<NamedSession>;

    /// Address a client travels to after joining `session_name`.
    fn resolved_connect_string(&self, session_name: &str) -> Option<String>;
}

struct RegisteredDelegate {
    kind: OperationKind,
    handle: DelegateHandle,
    delegate: CompletionDelegate,
}

/// Per-kind delegate lists for backend implementations.
///
/// Dispatch works on a snapshot, so delegates may add or clear registrations while a
/// completion is being delivered.
#[derive(Default)]
pub struct DelegateRegistry {
    next_handle: AtomicU64,
    delegates: Mutex<Vec<RegisteredDelegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: OperationKind, delegate: CompletionDelegate) -> DelegateHandle {
        let handle = DelegateHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().push(RegisteredDelegate {
            kind,
            handle,
            delegate,
        });
        handle
    }

    /// Removes a registration. Returns `false` if it was not registered for `kind`.
    pub fn clear(&self, kind: OperationKind, handle: DelegateHandle) -> bool {
        let mut delegates = self.lock();
        let before = delegates.len();
        delegates.retain(|entry| !(entry.kind == kind && entry.handle == handle));
        delegates.len() != before
    }

    pub fn len(&self, kind: OperationKind) -> usize {
        self.lock().iter().filter(|entry| entry.kind == kind).count()
    }

    pub fn is_empty(&self, kind: OperationKind) -> bool {
        self.len(kind) == 0
    }

    pub fn snapshot(&self, kind: OperationKind) -> Vec<CompletionDelegate> {
        self.lock()
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.delegate))
            .collect()
    }

    /// Delivers `completion` to every delegate of its kind, in registration order.
    pub fn broadcast(&self, completion: &Completion) {
        for delegate in self.snapshot(completion.kind()) {
            delegate(completion);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RegisteredDelegate>> {
        self.delegates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("registered", &self.lock().len())
            .finish()
    }
}
