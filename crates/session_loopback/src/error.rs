use multiplayer_sessions::JoinSessionResult;

/// Rule violations inside the loopback backend.
///
/// They never leave the backend as errors: each one becomes a failed completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopbackError {
    #[error("session name {0} already in use")]
    SessionExists(String),
    #[error("no local session named {0}")]
    NoNamedSession(String),
    #[error("session {0} is not advertised")]
    NotAdvertised(String),
    #[error("session {0} is full")]
    SessionFull(String),
    #[error("already in session {0}")]
    AlreadyInSession(String),
}

impl From<LoopbackError> for JoinSessionResult {
    fn from(err: LoopbackError) -> Self {
        match err {
            LoopbackError::SessionExists(_) | LoopbackError::AlreadyInSession(_) => {
                JoinSessionResult::AlreadyInSession
            }
            LoopbackError::NotAdvertised(_) => JoinSessionResult::SessionDoesNotExist,
            LoopbackError::SessionFull(_) => JoinSessionResult::SessionIsFull,
            LoopbackError::NoNamedSession(_) => JoinSessionResult::UnknownError,
        }
    }
}
