//! Tile provider configuration and the active base layer.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::ViewerApi;
use crate::preferences::{PreferenceStore, PROVIDER_KEY};
use crate::render::{BaseLayerSpec, LayerId, MapSurface};
use crate::state::SessionHandle;

pub const FALLBACK_PROVIDER_KEY: &str = "opentopomap";
const FALLBACK_DISPLAY_NAME: &str = "OpenTopoMap";
const FALLBACK_MAX_ZOOM: u8 = 15;
const FALLBACK_ATTRIBUTION: &str =
    "Map data: © OpenStreetMap contributors, SRTM | Map style: © OpenTopoMap (CC-BY-SA)";
const DEFAULT_MAX_ZOOM: u8 = 18;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "isTMS", default)]
    pub is_tiled_map_service: bool,
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    #[serde(default)]
    pub attribution: String,
}

fn default_max_zoom() -> u8 {
    DEFAULT_MAX_ZOOM
}

/// Provider configuration as served by the tile endpoint. Provider order is
/// the order of keys in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "initial", default)]
    pub initial_key: Option<String>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub providers: IndexMap<String, ProviderDefinition>,
    /// Set when the configuration fetch failed and the built-in provider is
    /// in use.
    #[serde(skip)]
    pub fallback: bool,
}

impl ProviderConfig {
    pub fn provider(&self, key: &str) -> Option<&ProviderDefinition> {
        self.providers.get(key)
    }

    /// Display name for a key, or the key itself when it is unknown.
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.provider(key)
            .map(|provider| provider.display_name.as_str())
            .unwrap_or(key)
    }
}

pub fn fallback_config() -> ProviderConfig {
    let mut providers = IndexMap::new();
    providers.insert(
        FALLBACK_PROVIDER_KEY.to_string(),
        ProviderDefinition {
            display_name: FALLBACK_DISPLAY_NAME.to_string(),
            is_tiled_map_service: false,
            min_zoom: 0,
            max_zoom: FALLBACK_MAX_ZOOM,
            attribution: FALLBACK_ATTRIBUTION.to_string(),
        },
    );
    ProviderConfig {
        initial_key: Some(FALLBACK_PROVIDER_KEY.to_string()),
        offline: false,
        providers,
        fallback: true,
    }
}

pub fn tile_url_template(api_base: &str, key: &str) -> String {
    format!("{}/tiles/{key}/{{z}}/{{x}}/{{y}}.png", api_base.trim_end_matches('/'))
}

/// Persisted key first, then the configured initial key, then the first
/// provider in document order.
pub fn resolve_initial_provider(config: &ProviderConfig, persisted: Option<&str>) -> Option<String> {
    persisted
        .filter(|key| config.providers.contains_key(*key))
        .or_else(|| {
            config
                .initial_key
                .as_deref()
                .filter(|key| config.providers.contains_key(*key))
        })
        .or_else(|| config.providers.keys().next().map(String::as_str))
        .map(str::to_string)
}

pub struct ProviderRegistry {
    session: SessionHandle,
    api: Arc<dyn ViewerApi>,
    map: Arc<dyn MapSurface>,
    preferences: Arc<dyn PreferenceStore>,
    api_base: String,
}

impl ProviderRegistry {
    pub fn new(
        session: SessionHandle,
        api: Arc<dyn ViewerApi>,
        map: Arc<dyn MapSurface>,
        preferences: Arc<dyn PreferenceStore>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            session,
            api,
            map,
            preferences,
            api_base: api_base.into(),
        }
    }

    /// Fetches the configuration (or falls back), registers one base layer
    /// per provider and attaches the resolved one. Returns the active key.
    pub async fn initialize(&self) -> Option<String> {
        let config = match self.api.tile_config().await {
            Ok(config) => config,
            Err(err) => {
                warn!(?err, "tile configuration unavailable; using built-in provider");
                fallback_config()
            }
        };

        let layers: IndexMap<String, LayerId> = config
            .providers
            .iter()
            .map(|(key, provider)| {
                let spec = BaseLayerSpec {
                    provider_key: key.clone(),
                    display_name: provider.display_name.clone(),
                    url_template: tile_url_template(&self.api_base, key),
                    min_zoom: provider.min_zoom,
                    max_zoom: provider.max_zoom,
                    attribution: provider.attribution.clone(),
                    tms: provider.is_tiled_map_service,
                };
                (key.clone(), self.map.register_base_layer(&spec))
            })
            .collect();

        let persisted = self.preferences.get(PROVIDER_KEY);
        let active = resolve_initial_provider(&config, persisted.as_deref());
        if let Some(layer) = active.as_ref().and_then(|key| layers.get(key)) {
            self.map.activate_base_layer(*layer);
        }

        info!(
            providers = config.providers.len(),
            active = ?active,
            fallback = config.fallback,
            offline = config.offline,
            "tile providers registered"
        );

        self.session.update(|state| {
            state.provider_config = Some(config);
            state.provider_layers = layers;
            state.active_provider_key = active.clone();
        });
        active
    }

    /// Handles the map's base-layer change event. Returns whether the layer
    /// belonged to a known provider.
    pub fn on_base_layer_change(&self, layer: LayerId) -> bool {
        let key = self.session.update(|state| {
            let key = state
                .provider_layers
                .iter()
                .find(|(_, id)| **id == layer)
                .map(|(key, _)| key.clone())?;
            state.active_provider_key = Some(key.clone());
            state.prewarm_status_text = None;
            Some(key)
        });

        let Some(key) = key else {
            debug!(?layer, "ignoring change to unregistered base layer");
            return false;
        };
        if let Err(err) = self.preferences.set(PROVIDER_KEY, &key) {
            warn!(?err, provider = %key, "failed to persist provider choice");
        }
        info!(provider = %key, "active tile provider changed");
        true
    }

    pub fn active_provider(&self) -> Option<(String, ProviderDefinition)> {
        self.session.read(|state| {
            let key = state.active_provider_key.as_ref()?;
            let provider = state.provider_config.as_ref()?.provider(key)?;
            Some((key.clone(), provider.clone()))
        })
    }
}
