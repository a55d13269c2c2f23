//! Headless host/join flow.
//!
//! Hosting creates a session and opens the lobby as a listen server once it exists.
//! Joining searches, joins the first result advertising the menu's match type, then
//! connects to the address the backend resolved for the joined session.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::{
    backend::{JoinSessionResult, SessionSearchResult},
    config::MenuSettings,
    coordinator::SessionCoordinator,
    events::{FindSessionsComplete, HandlerId},
};

/// Level travel performed after a session was created or joined.
pub trait Travel: Send + Sync {
    /// Host side: load `url` as a listen server.
    fn server_travel(&self, url: &str);
    /// Client side: connect to `address`.
    fn client_travel(&self, address: &str);
}

/// First result whose advertised match type equals `match_type`.
pub fn first_matching<'a>(
    results: &'a [SessionSearchResult],
    match_type: &str,
) -> Option<&'a SessionSearchResult> {
    results
        .iter()
        .find(|result| result.match_type() == Some(match_type))
}

struct Bindings {
    create: HandlerId,
    find: HandlerId,
    join: HandlerId,
}

pub struct SessionMenu {
    coordinator: Arc<SessionCoordinator>,
    settings: MenuSettings,
    bindings: Option<Bindings>,
}

impl SessionMenu {
    /// Binds the menu to the coordinator's completion events.
    pub fn setup(
        coordinator: &Arc<SessionCoordinator>,
        settings: MenuSettings,
        travel: Arc<dyn Travel>,
    ) -> Self {
        let events = coordinator.events();

        let listen_url = listen_url(&settings.lobby_path);
        let host_travel = Arc::clone(&travel);
        let create = events.on_create_complete.add(move |successful: &bool| {
            if *successful {
                info!(url = %listen_url, "session created, opening lobby");
                host_travel.server_travel(&listen_url);
            } else {
                warn!("session creation failed");
            }
        });

        let weak: Weak<SessionCoordinator> = Arc::downgrade(coordinator);
        let match_type = settings.match_type.clone();
        let find = events.on_find_complete.add(move |outcome: &FindSessionsComplete| {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            if !outcome.successful {
                warn!("no sessions found");
                return;
            }
            for result in &outcome.results {
                debug!(
                    session_id = %result.session_id,
                    user = %result.owning_user_name,
                    "found session"
                );
            }
            match first_matching(&outcome.results, &match_type) {
                Some(result) => {
                    info!(session_id = %result.session_id, %match_type, "joining session");
                    coordinator.join_session(result);
                }
                None => debug!(%match_type, "no session advertises the requested match type"),
            }
        });

        let weak: Weak<SessionCoordinator> = Arc::downgrade(coordinator);
        let join = events.on_join_complete.add(move |result: &JoinSessionResult| {
            if !result.is_success() {
                warn!(%result, "joining session failed");
                return;
            }
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            match coordinator.connect_string() {
                Some(address) => {
                    info!(%address, "session joined, connecting");
                    travel.client_travel(&address);
                }
                None => warn!("joined session has no resolvable connect string"),
            }
        });

        Self {
            coordinator: Arc::clone(coordinator),
            settings,
            bindings: Some(Bindings { create, find, join }),
        }
    }

    pub fn settings(&self) -> &MenuSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn host(&self) {
        self.coordinator
            .create_session(self.settings.num_public_connections, self.settings.match_type.clone());
    }

    pub fn join(&self) {
        self.coordinator
            .find_sessions(self.coordinator.config().search_max_results);
    }

    /// Unbinds all handlers. Called automatically on drop.
    pub fn teardown(&mut self) {
        if let Some(bindings) = self.bindings.take() {
            let events = self.coordinator.events();
            events.on_create_complete.remove(bindings.create);
            events.on_find_complete.remove(bindings.find);
            events.on_join_complete.remove(bindings.join);
        }
    }
}

impl Drop for SessionMenu {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn listen_url(lobby_path: &str) -> String {
    format!("{lobby_path}?listen")
}
