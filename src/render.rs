//! Seams to the external map surface and UI.
//!
//! The core never draws anything itself. It hands parsed tracks and tile
//! layer specs to a [`MapSurface`] and pushes presentation snapshots to a
//! [`ViewerUi`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::api::ViewerApi;
use crate::errors::{AppError, AppResult};
use crate::geo::{BoundsRect, GeoBounds};
use crate::gpx::{self, InfoPanel, ParsedTrack, TrackStats};

/// Owned handle to a drawn overlay. Not clonable: exactly one overlay record
/// owns it and it is given back to the surface to be destroyed.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RendererHandle(u64);

impl RendererHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Stable identifier of a registered base tile layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LayerId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub color: &'static str,
    pub opacity: f32,
    pub weight: u8,
}

impl OverlayStyle {
    pub fn track(color: &'static str) -> Self {
        Self {
            color,
            opacity: 0.8,
            weight: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseLayerSpec {
    pub provider_key: String,
    pub display_name: String,
    pub url_template: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub attribution: String,
    pub tms: bool,
}

#[derive(Debug)]
pub struct MaterializedOverlay {
    pub handle: RendererHandle,
    pub bounds: BoundsRect,
    pub stats: TrackStats,
}

pub trait MapSurface: Send + Sync {
    fn draw_track(&self, track: &ParsedTrack, style: &OverlayStyle) -> AppResult<RendererHandle>;

    fn destroy_overlay(&self, handle: RendererHandle);

    fn fit_bounds(&self, bounds: BoundsRect);

    fn zoom(&self) -> i32;

    /// `None` when the surface cannot describe its viewport.
    fn bounds(&self) -> Option<GeoBounds>;

    fn register_base_layer(&self, spec: &BaseLayerSpec) -> LayerId;

    fn activate_base_layer(&self, layer: LayerId);
}

/// Turns a track path into a drawn overlay. May complete long after the
/// request was made.
#[async_trait]
pub trait OverlayLoader: Send + Sync {
    async fn materialize(&self, path: &str, style: &OverlayStyle) -> AppResult<MaterializedOverlay>;
}

pub struct GpxOverlayLoader {
    api: Arc<dyn ViewerApi>,
    map: Arc<dyn MapSurface>,
}

impl GpxOverlayLoader {
    pub fn new(api: Arc<dyn ViewerApi>, map: Arc<dyn MapSurface>) -> Self {
        Self { api, map }
    }
}

#[async_trait]
impl OverlayLoader for GpxOverlayLoader {
    async fn materialize(&self, path: &str, style: &OverlayStyle) -> AppResult<MaterializedOverlay> {
        let bytes = self.api.fetch_track(path).await?;
        let track = gpx::parse_gpx(&bytes)?;
        let bounds = track
            .bounds()
            .ok_or_else(|| AppError::Render(format!("{path} has no drawable points")))?;
        let stats = track.stats();
        let handle = self.map.draw_track(&track, style)?;
        Ok(MaterializedOverlay {
            handle,
            bounds,
            stats,
        })
    }
}

/// How one loaded track should be reflected in the file list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSelection {
    pub path: String,
    pub color: &'static str,
    pub focused: bool,
}

/// Snapshot of the download-current-view control.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmControlView {
    pub download_enabled: bool,
    pub cancel_visible: bool,
    /// Confirmation prompt, shown instead of the download button.
    pub confirm_text: Option<String>,
    pub status_text: String,
    pub progress_percent: Option<u8>,
}

pub trait ViewerUi: Send + Sync {
    fn show_info_panel(&self, panel: &InfoPanel);

    fn hide_info_panel(&self);

    fn refresh_track_selection(&self, selection: &[TrackSelection]);

    fn overlay_failed(&self, path: &str, error: &AppError);

    fn listing_failed(&self, error: &AppError);

    fn render_prewarm_control(&self, view: &PrewarmControlView);
}
