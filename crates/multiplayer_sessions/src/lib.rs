//! Multiplayer session lifecycle for Forge of Stories.
//!
//! This crate hosts everything needed to drive a single matchmaking session slot:
//! - backend: the capability boundary to the online service (requests + completion delegates)
//! - settings: value objects built per create/find request
//! - events: multicast completion events re-exposed to menus and gameplay
//! - coordinator: the session coordinator state machine
//! - config: `[sessions]` configuration section
//! - menu: headless host/join flow that reacts to coordinator events
//!
//! Keep this crate free of transport code. Concrete backends live in their own crates.

/// Backend capability consumed by the coordinator
pub mod backend;
/// Configuration section for sessions and the host/join menu
pub mod config;
/// The session coordinator
pub mod coordinator;
/// Multicast completion events
pub mod events;
/// Headless host/join flow
pub mod menu;
/// Session settings and search parameters
pub mod settings;

pub use backend::{
    Completion, CompletionDelegate, DelegateHandle, DelegateRegistry, JoinSessionResult,
    NamedSession, OperationKind, SessionBackend, SessionSearchResult, UserId, NULL_SUBSYSTEM,
    SESSION_NAME_GAME, SETTING_MATCH_TYPE,
};
pub use config::{ConfigError, MenuSettings, SessionConfig};
pub use coordinator::SessionCoordinator;
pub use events::{FindSessionsComplete, HandlerId, MulticastEvent, SessionEvents};
pub use menu::{first_matching, SessionMenu, Travel};
pub use settings::{AdvertisedSetting, Advertisement, SearchParameters, SessionSettings};

/// Convenience prelude for downstream crates.
pub mod prelude {
    pub use crate::backend::{
        Completion, JoinSessionResult, OperationKind, SessionBackend, SessionSearchResult, UserId,
    };
    pub use crate::config::SessionConfig;
    pub use crate::coordinator::SessionCoordinator;
    pub use crate::events::FindSessionsComplete;
    pub use crate::menu::{SessionMenu, Travel};
}
