//! Shared in-memory registry of advertised sessions.
//!
//! Cloning a [`LoopbackNetwork`] shares the registry, so every backend built from the
//! same network can find and join sessions advertised by the others.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use multiplayer_sessions::{SearchParameters, SessionSearchResult, SessionSettings, UserId};

use crate::error::LoopbackError;

#[derive(Debug, Clone)]
struct AdvertisedSession {
    host: UserId,
    host_address: String,
    settings: SessionSettings,
    /// Host first, then every player that joined.
    members: Vec<UserId>,
}

impl AdvertisedSession {
    fn open_connections(&self) -> u32 {
        let taken = u32::try_from(self.members.len()).unwrap_or(u32::MAX);
        self.settings.num_public_connections.saturating_sub(taken)
    }
}

/// What a player receives when a host admits them.
#[derive(Debug, Clone)]
pub(crate) struct Admission {
    pub host: UserId,
    pub host_address: String,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    sessions: Arc<Mutex<BTreeMap<String, AdvertisedSession>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently visible to searches.
    pub fn advertised_count(&self) -> usize {
        self.lock().len()
    }

    /// Host and joined players of `session_id`, host first.
    pub fn members(&self, session_id: &str) -> Vec<UserId> {
        self.lock()
            .get(session_id)
            .map(|session| session.members.clone())
            .unwrap_or_default()
    }

    pub(crate) fn advertise(
        &self,
        session_id: &str,
        host: &UserId,
        host_address: &str,
        settings: &SessionSettings,
    ) {
        self.lock().insert(
            session_id.to_owned(),
            AdvertisedSession {
                host: host.clone(),
                host_address: host_address.to_owned(),
                settings: settings.clone(),
                members: vec![host.clone()],
            },
        );
    }

    pub(crate) fn withdraw(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    /// Sessions visible to `requester`, never including its own.
    pub(crate) fn search(
        &self,
        requester: &UserId,
        search: &SearchParameters,
    ) -> Vec<SessionSearchResult> {
        let limit = usize::try_from(search.max_results).unwrap_or(usize::MAX);
        self.lock()
            .iter()
            .filter(|(_, session)| &session.host != requester)
            .filter(|(_, session)| session.settings.is_lan_match == search.is_lan_query)
            .filter(|(_, session)| !search.presence_only || session.settings.uses_presence)
            .take(limit)
            .map(|(session_id, session)| SessionSearchResult {
                session_id: session_id.clone(),
                owning_user_name: session.host.to_string(),
                owning_user: session.host.clone(),
                open_public_connections: session.open_connections(),
                max_public_connections: session.settings.num_public_connections,
                ping_ms: Some(0),
                settings: session.settings.advertised_attributes(),
            })
            .collect()
    }

    pub(crate) fn admit(
        &self,
        session_id: &str,
        player: &UserId,
    ) -> Result<Admission, LoopbackError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| LoopbackError::NotAdvertised(session_id.to_owned()))?;
        if session.members.contains(player) {
            return Err(LoopbackError::AlreadyInSession(session_id.to_owned()));
        }
        if session.open_connections() == 0 {
            return Err(LoopbackError::SessionFull(session_id.to_owned()));
        }
        session.members.push(player.clone());
        Ok(Admission {
            host: session.host.clone(),
            host_address: session.host_address.clone(),
            settings: session.settings.clone(),
        })
    }

    pub(crate) fn release(&self, session_id: &str, player: &UserId) {
        if let Some(session) = self.lock().get_mut(session_id) {
            session.members.retain(|member| member != player);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, AdvertisedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
