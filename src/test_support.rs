//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::{PrewarmSummary, PrewarmViewRequest, ProgressFn, TrackFile, ViewerApi};
use crate::errors::{AppError, AppResult};
use crate::geo::{BoundsRect, GeoBounds};
use crate::gpx::{InfoPanel, ParsedTrack, TrackStats};
use crate::providers::ProviderConfig;
use crate::render::{
    BaseLayerSpec, LayerId, MapSurface, MaterializedOverlay, OverlayLoader, OverlayStyle,
    PrewarmControlView, RendererHandle, TrackSelection, ViewerUi,
};

/// Yields to the runtime until `condition` holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after 1000 yields");
}

pub fn sample_stats() -> TrackStats {
    TrackStats {
        distance_m: 2_000.0,
        total_time_ms: 600_000,
        moving_time_ms: 600_000,
        start_time: None,
        moving_speed_kmh: 12.0,
        elevation_gain_m: 20.0,
        elevation_loss_m: 5.0,
    }
}

pub fn sample_bounds() -> BoundsRect {
    BoundsRect {
        north: 58.4,
        south: 58.3,
        east: 24.6,
        west: 24.5,
    }
}

#[derive(Default)]
pub struct FakeMap {
    next_handle: AtomicU64,
    issued: Mutex<Vec<u64>>,
    destroyed: Mutex<Vec<u64>>,
    fitted: Mutex<Vec<BoundsRect>>,
    layers: Mutex<Vec<BaseLayerSpec>>,
    activated: Mutex<Vec<LayerId>>,
    view: Mutex<(i32, Option<GeoBounds>)>,
}

impl FakeMap {
    pub fn set_view(&self, zoom: i32, bounds: Option<GeoBounds>) {
        *self.view.lock() = (zoom, bounds);
    }

    pub fn issue_handle(&self) -> RendererHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.issued.lock().push(id);
        RendererHandle::new(id)
    }

    pub fn live_handles(&self) -> usize {
        let destroyed = self.destroyed.lock();
        self.issued
            .lock()
            .iter()
            .filter(|id| !destroyed.contains(id))
            .count()
    }

    pub fn destroyed(&self) -> Vec<u64> {
        self.destroyed.lock().clone()
    }

    pub fn fitted(&self) -> Vec<BoundsRect> {
        self.fitted.lock().clone()
    }

    pub fn registered_layers(&self) -> Vec<BaseLayerSpec> {
        self.layers.lock().clone()
    }

    pub fn active_layers(&self) -> Vec<LayerId> {
        self.activated.lock().clone()
    }
}

impl MapSurface for FakeMap {
    fn draw_track(&self, _track: &ParsedTrack, _style: &OverlayStyle) -> AppResult<RendererHandle> {
        Ok(self.issue_handle())
    }

    fn destroy_overlay(&self, handle: RendererHandle) {
        let mut destroyed = self.destroyed.lock();
        assert!(
            !destroyed.contains(&handle.id()),
            "handle {} destroyed twice",
            handle.id()
        );
        destroyed.push(handle.id());
    }

    fn fit_bounds(&self, bounds: BoundsRect) {
        self.fitted.lock().push(bounds);
    }

    fn zoom(&self) -> i32 {
        self.view.lock().0
    }

    fn bounds(&self) -> Option<GeoBounds> {
        self.view.lock().1
    }

    fn register_base_layer(&self, spec: &BaseLayerSpec) -> LayerId {
        let mut layers = self.layers.lock();
        layers.push(spec.clone());
        LayerId(layers.len() as u64)
    }

    fn activate_base_layer(&self, layer: LayerId) {
        self.activated.lock().push(layer);
    }
}

/// Loader whose completions can be held back per path.
pub struct FakeLoader {
    map: Arc<FakeMap>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    failing: Mutex<HashSet<String>>,
    requests: AtomicUsize,
}

impl FakeLoader {
    pub fn new(map: Arc<FakeMap>) -> Self {
        Self {
            map,
            gates: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// The next load of `path` waits until the returned sender fires.
    pub fn hold(&self, path: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(path.to_string(), rx);
        tx
    }

    pub fn fail(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OverlayLoader for FakeLoader {
    async fn materialize(&self, path: &str, _style: &OverlayStyle) -> AppResult<MaterializedOverlay> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().remove(path);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing.lock().contains(path) {
            return Err(AppError::Render(format!("cannot draw {path}")));
        }
        Ok(MaterializedOverlay {
            handle: self.map.issue_handle(),
            bounds: sample_bounds(),
            stats: sample_stats(),
        })
    }
}

#[derive(Default)]
pub struct FakeUi {
    panels: Mutex<Vec<InfoPanel>>,
    hidden: AtomicUsize,
    selections: Mutex<Vec<Vec<TrackSelection>>>,
    failures: Mutex<Vec<String>>,
    listing_failures: AtomicUsize,
    prewarm_views: Mutex<Vec<PrewarmControlView>>,
}

impl FakeUi {
    pub fn last_panel(&self) -> Option<InfoPanel> {
        self.panels.lock().last().cloned()
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn last_selection(&self) -> Option<Vec<TrackSelection>> {
        self.selections.lock().last().cloned()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn listing_failures(&self) -> usize {
        self.listing_failures.load(Ordering::SeqCst)
    }

    pub fn prewarm_views(&self) -> Vec<PrewarmControlView> {
        self.prewarm_views.lock().clone()
    }

    pub fn last_prewarm_view(&self) -> Option<PrewarmControlView> {
        self.prewarm_views.lock().last().cloned()
    }
}

impl ViewerUi for FakeUi {
    fn show_info_panel(&self, panel: &InfoPanel) {
        self.panels.lock().push(panel.clone());
    }

    fn hide_info_panel(&self) {
        self.hidden.fetch_add(1, Ordering::SeqCst);
    }

    fn refresh_track_selection(&self, selection: &[TrackSelection]) {
        self.selections.lock().push(selection.to_vec());
    }

    fn overlay_failed(&self, path: &str, _error: &AppError) {
        self.failures.lock().push(path.to_string());
    }

    fn listing_failed(&self, _error: &AppError) {
        self.listing_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn render_prewarm_control(&self, view: &PrewarmControlView) {
        self.prewarm_views.lock().push(view.clone());
    }
}

/// Scripted viewer API. Unset responses fail with a server error.
#[derive(Default)]
pub struct FakeApi {
    pub tile_config: Mutex<Option<ProviderConfig>>,
    pub listing: Mutex<Option<Vec<TrackFile>>>,
    pub tracks: Mutex<HashMap<String, Vec<u8>>>,
    prewarm_response: Mutex<Option<PrewarmSummary>>,
    prewarm_gate: Mutex<Option<oneshot::Receiver<()>>>,
    prewarm_requests: Mutex<Vec<PrewarmViewRequest>>,
    aborted: AtomicBool,
}

impl FakeApi {
    pub fn respond_with(&self, summary: PrewarmSummary) {
        *self.prewarm_response.lock() = Some(summary);
    }

    /// The next pre-warm call blocks until the sender fires or the job is
    /// canceled.
    pub fn hold_prewarm(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.prewarm_gate.lock() = Some(rx);
        tx
    }

    pub fn prewarm_calls(&self) -> usize {
        self.prewarm_requests.lock().len()
    }

    pub fn last_prewarm_request(&self) -> Option<PrewarmViewRequest> {
        self.prewarm_requests.lock().last().cloned()
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn server_error(endpoint: &str) -> AppError {
        AppError::Status {
            endpoint: endpoint.to_string(),
            status: 500,
        }
    }
}

#[async_trait]
impl ViewerApi for FakeApi {
    async fn list_tracks(&self) -> AppResult<Vec<TrackFile>> {
        self.listing
            .lock()
            .clone()
            .ok_or_else(|| Self::server_error(crate::api::LISTING_PATH))
    }

    async fn tile_config(&self) -> AppResult<ProviderConfig> {
        self.tile_config
            .lock()
            .clone()
            .ok_or_else(|| Self::server_error(crate::api::TILE_CONFIG_PATH))
    }

    async fn fetch_track(&self, path: &str) -> AppResult<Vec<u8>> {
        self.tracks
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::server_error(path))
    }

    async fn prewarm_view(
        &self,
        request: &PrewarmViewRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> AppResult<PrewarmSummary> {
        self.prewarm_requests.lock().push(request.clone());
        let gate = self.prewarm_gate.lock().take();
        if let Some(gate) = gate {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.aborted.store(true, Ordering::SeqCst);
                    return Err(AppError::Canceled);
                }
                _ = gate => {}
            }
        }
        let summary = self
            .prewarm_response
            .lock()
            .clone()
            .ok_or_else(|| Self::server_error(crate::api::PREWARM_PATH))?;
        progress(10);
        progress(100);
        Ok(summary)
    }
}
