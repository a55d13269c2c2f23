use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::SETTING_MATCH_TYPE;

/// How a session attribute is published by the online service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Advertisement {
    /// Kept locally, never sent to the service.
    DontAdvertise,
    /// Published through the online service only.
    ViaOnlineService,
    /// Published through the online service and in ping replies.
    ViaOnlineServiceAndPing,
}

/// A single advertised key/value attribute of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedSetting {
    pub value: String,
    pub advertisement: Advertisement,
}

impl AdvertisedSetting {
    pub fn new(value: impl Into<String>, advertisement: Advertisement) -> Self {
        Self {
            value: value.into(),
            advertisement,
        }
    }
}

/// Description of a session to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub num_public_connections: u32,
    pub allow_join_in_progress: bool,
    pub allow_join_via_presence: bool,
    pub should_advertise: bool,
    pub uses_presence: bool,
    pub use_lobbies_if_available: bool,
    pub is_lan_match: bool,
    pub build_unique_id: u32,
    pub attributes: BTreeMap<String, AdvertisedSetting>,
}

impl SessionSettings {
    /// Settings for a presence-advertised session tagged with `match_type`.
    ///
    /// Join-in-progress, presence, advertising and lobbies are always enabled; only the
    /// connection count, the match type, the LAN flag and the build id vary.
    pub fn advertised_match(
        num_public_connections: u32,
        match_type: &str,
        is_lan_match: bool,
        build_unique_id: u32,
    ) -> Self {
        let mut settings = Self {
            num_public_connections,
            allow_join_in_progress: true,
            allow_join_via_presence: true,
            should_advertise: true,
            uses_presence: true,
            use_lobbies_if_available: true,
            is_lan_match,
            build_unique_id,
            attributes: BTreeMap::new(),
        };
        settings.set(
            SETTING_MATCH_TYPE,
            match_type,
            Advertisement::ViaOnlineServiceAndPing,
        );
        settings
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|setting| setting.value.as_str())
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        advertisement: Advertisement,
    ) {
        self.attributes
            .insert(key.into(), AdvertisedSetting::new(value, advertisement));
    }

    pub fn match_type(&self) -> Option<&str> {
        self.get(SETTING_MATCH_TYPE)
    }

    /// Attributes visible to searching players (everything except `DontAdvertise`).
    pub fn advertised_attributes(&self) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .filter(|(_, setting)| setting.advertisement != Advertisement::DontAdvertise)
            .map(|(key, setting)| (key.clone(), setting.value.clone()))
            .collect()
    }
}

/// Parameters of a session search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameters {
    pub max_results: u32,
    pub is_lan_query: bool,
    pub presence_only: bool,
}

impl SearchParameters {
    /// Presence-scoped search. The coordinator only ever searches this way.
    pub const fn presence(max_results: u32, is_lan_query: bool) -> Self {
        Self {
            max_results,
            is_lan_query,
            presence_only: true,
        }
    }
}
