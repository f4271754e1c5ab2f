pub mod api;
pub mod colors;
pub mod config;
pub mod errors;
pub mod geo;
pub mod gpx;
pub mod preferences;
pub mod prewarm;
pub mod providers;
pub mod render;
pub mod state;
pub mod tracks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::{HttpViewerApi, TrackFile, ViewerApi};
use crate::config::AppConfig;
use crate::preferences::{persist_theme, persisted_theme, JsonPreferenceStore, PreferenceStore, Theme};
use crate::prewarm::PrewarmController;
use crate::providers::ProviderRegistry;
use crate::render::{GpxOverlayLoader, LayerId, MapSurface, OverlayLoader, ViewerUi};
use crate::state::SessionHandle;
use crate::tracks::TrackOverlayManager;

pub use errors::{AppError, AppResult};
pub use state::{JobStatus, PrewarmOutcome, SessionState};

/// One viewer session: the shared store plus every component that mutates it.
pub struct Viewer {
    config: AppConfig,
    session: SessionHandle,
    api: Arc<dyn ViewerApi>,
    ui: Arc<dyn ViewerUi>,
    preferences: Arc<dyn PreferenceStore>,
    pub tracks: TrackOverlayManager,
    pub providers: ProviderRegistry,
    pub prewarm: PrewarmController,
}

impl Viewer {
    /// Builds a viewer that loads overlays from GPX documents served by `api`.
    /// Overlay loads are spawned onto `runtime`.
    pub fn new(
        config: AppConfig,
        api: Arc<dyn ViewerApi>,
        map: Arc<dyn MapSurface>,
        ui: Arc<dyn ViewerUi>,
        preferences: Arc<dyn PreferenceStore>,
        runtime: Handle,
    ) -> Self {
        let loader = Arc::new(GpxOverlayLoader::new(api.clone(), map.clone()));
        Self::with_loader(config, api, map, ui, preferences, loader, runtime)
    }

    pub fn with_loader(
        config: AppConfig,
        api: Arc<dyn ViewerApi>,
        map: Arc<dyn MapSurface>,
        ui: Arc<dyn ViewerUi>,
        preferences: Arc<dyn PreferenceStore>,
        loader: Arc<dyn OverlayLoader>,
        runtime: Handle,
    ) -> Self {
        let session = SessionHandle::default();
        let tracks = TrackOverlayManager::new(
            session.clone(),
            loader,
            map.clone(),
            ui.clone(),
            runtime,
        );
        let providers = ProviderRegistry::new(
            session.clone(),
            api.clone(),
            map.clone(),
            preferences.clone(),
            config.api_base.clone(),
        );
        let prewarm = PrewarmController::new(
            session.clone(),
            api.clone(),
            map,
            ui.clone(),
            config.prewarm_zoom_radius,
        );
        Self {
            config,
            session,
            api,
            ui,
            preferences,
            tracks,
            providers,
            prewarm,
        }
    }

    /// Installs the log subscriber, connects to the configured server and
    /// opens the preference file.
    pub fn connect(
        config: AppConfig,
        map: Arc<dyn MapSurface>,
        ui: Arc<dyn ViewerUi>,
        runtime: Handle,
    ) -> AppResult<Self> {
        init_tracing();
        let api = Arc::new(HttpViewerApi::new(&config)?);
        let preferences = Arc::new(JsonPreferenceStore::open(&config.preferences_file)?);
        Ok(Self::new(config, api, map, ui, preferences, runtime))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Loads the tile configuration and attaches the initial provider.
    /// Never fails; a missing configuration falls back to the built-in
    /// provider.
    pub async fn bootstrap(&self) -> Option<String> {
        self.prewarm.refresh_ui();
        let active = self.providers.initialize().await;
        self.prewarm.refresh_ui();
        info!(
            active = ?active,
            config = ?self.config.public_profile(),
            "viewer session ready"
        );
        active
    }

    /// Fetches the track listing. Failures are reported to the UI and leave
    /// the loaded overlays untouched.
    pub async fn load_track_listing(&self) -> Vec<TrackFile> {
        match self.api.list_tracks().await {
            Ok(files) => {
                info!(count = files.len(), "track listing loaded");
                files
            }
            Err(err) => {
                warn!(?err, "failed to load track listing");
                self.ui.listing_failed(&err);
                Vec::new()
            }
        }
    }

    /// Routes the map's base-layer change event.
    pub fn on_base_layer_change(&self, layer: LayerId) {
        if self.providers.on_base_layer_change(layer) {
            self.prewarm.refresh_ui();
        }
    }

    pub fn theme(&self) -> Theme {
        persisted_theme(self.preferences.as_ref()).unwrap_or_default()
    }

    pub fn toggle_theme(&self) -> Theme {
        let next = self.theme().toggled();
        if let Err(err) = persist_theme(self.preferences.as_ref(), next) {
            warn!(?err, theme = next.as_str(), "failed to persist theme");
        }
        next
    }

    /// Clears the session, cancelling any running download.
    pub fn reset(&self) {
        self.tracks.reset();
        self.prewarm.refresh_ui();
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,gpx_viewer_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    });
}
