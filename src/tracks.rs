//! Track overlay lifecycle.
//!
//! Every mutation happens inside one [`SessionHandle::update`] call and the
//! map/UI collaborators are invoked after the lock is released.
//! Materialization runs as a task spawned on the runtime handle captured at
//! construction, so tracks can be requested from threads outside that
//! runtime. Its continuation carries the load ticket issued with the record
//! and does nothing to a record that no longer carries that ticket.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::colors;
use crate::errors::AppResult;
use crate::geo::BoundsRect;
use crate::gpx::InfoPanel;
use crate::render::{
    MapSurface, MaterializedOverlay, OverlayLoader, OverlayStyle, RendererHandle, TrackSelection,
    ViewerUi,
};
use crate::state::{OverlayRecord, SessionHandle, SessionState};

enum Completion {
    Stale(RendererHandle),
    Stored { focus: Option<(BoundsRect, InfoPanel)> },
}

struct Removal {
    renderer: Option<RendererHandle>,
    was_focused: bool,
    fallback_panel: Option<InfoPanel>,
}

#[derive(Clone)]
pub struct TrackOverlayManager {
    session: SessionHandle,
    loader: Arc<dyn OverlayLoader>,
    map: Arc<dyn MapSurface>,
    ui: Arc<dyn ViewerUi>,
    runtime: Handle,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TrackOverlayManager {
    pub fn new(
        session: SessionHandle,
        loader: Arc<dyn OverlayLoader>,
        map: Arc<dyn MapSurface>,
        ui: Arc<dyn ViewerUi>,
        runtime: Handle,
    ) -> Self {
        Self {
            session,
            loader,
            map,
            ui,
            runtime,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_track(&self, path: &str, display_name: &str) {
        let (loaded, multi_mode) = self.session.read(|s| (s.is_loaded(path), s.multi_mode));
        if loaded {
            debug!(path = %path, "track already loaded");
            return;
        }
        if !multi_mode {
            for other in self.paths_except(Some(path)) {
                self.remove_track(&other);
            }
        }
        self.begin_load(path, display_name, false);
        self.refresh_selection();
    }

    pub fn remove_track(&self, path: &str) {
        let removal = self.session.update(|s| {
            let record = s.loaded_overlays.shift_remove(path)?;
            let was_focused = s.is_focused(path);
            let mut fallback_panel = None;
            if was_focused {
                s.focused_path = None;
                if let Some((next_path, next)) = s.loaded_overlays.first() {
                    fallback_panel = panel_for(next);
                    s.focused_path = Some(next_path.clone());
                }
            }
            Some(Removal {
                renderer: record.renderer,
                was_focused,
                fallback_panel,
            })
        });

        let Some(removal) = removal else {
            debug!(path = %path, "remove requested for track that is not loaded");
            return;
        };
        if let Some(handle) = removal.renderer {
            self.map.destroy_overlay(handle);
        }
        if removal.was_focused {
            self.ui.hide_info_panel();
            if let Some(panel) = removal.fallback_panel {
                self.ui.show_info_panel(&panel);
            }
        }
        debug!(path = %path, "track removed");
        self.refresh_selection();
    }

    /// Shows `path` alone, loading it when needed.
    pub fn focus_track(&self, path: &str, display_name: &str) {
        for other in self.paths_except(Some(path)) {
            self.remove_track(&other);
        }

        if !self.session.read(|s| s.is_loaded(path)) {
            self.begin_load(path, display_name, true);
            self.refresh_selection();
            return;
        }

        let (bounds, panel) = self.session.update(|s| {
            s.focused_path = Some(path.to_string());
            s.loaded_overlays
                .get(path)
                .map(|record| (record.bounds, panel_for(record)))
                .unwrap_or((None, None))
        });
        if let Some(bounds) = bounds {
            self.map.fit_bounds(bounds);
        }
        if let Some(panel) = panel {
            self.ui.show_info_panel(&panel);
        }
        self.refresh_selection();
    }

    pub fn toggle_track_visibility(&self, path: &str, display_name: &str, should_show: bool) {
        if !self.session.read(|s| s.multi_mode) {
            debug!(path = %path, "visibility toggle ignored outside multi-track mode");
            return;
        }
        if should_show {
            self.add_track(path, display_name);
        } else {
            self.remove_track(path);
        }
    }

    /// Keeps the focused overlay, or the first loaded one, and removes the rest.
    pub fn enforce_single_track(&self) {
        let keep = self.session.read(|s| {
            s.focused_path
                .clone()
                .or_else(|| s.loaded_overlays.keys().next().cloned())
        });
        for path in self.paths_except(keep.as_deref()) {
            self.remove_track(&path);
        }
    }

    pub fn set_multi_mode(&self, enabled: bool) {
        self.session.update(|s| s.multi_mode = enabled);
        info!(enabled, "multi-track mode changed");
        if !enabled {
            self.enforce_single_track();
        }
    }

    /// Waits for every materialization requested so far.
    pub async fn settle(&self) {
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            for result in join_all(batch).await {
                if let Err(err) = result {
                    warn!(?err, "overlay materialization task aborted");
                }
            }
        }
    }

    /// Resets the whole session and destroys every drawn overlay.
    pub fn reset(&self) {
        let handles = self.session.update(SessionState::reset);
        for handle in handles {
            self.map.destroy_overlay(handle);
        }
        self.ui.hide_info_panel();
        self.refresh_selection();
    }

    pub fn selection(&self) -> Vec<TrackSelection> {
        self.session.read(|s| {
            s.loaded_overlays
                .values()
                .map(|record| TrackSelection {
                    path: record.path.clone(),
                    color: record.color,
                    focused: s.is_focused(&record.path),
                })
                .collect()
        })
    }

    fn refresh_selection(&self) {
        self.ui.refresh_track_selection(&self.selection());
    }

    fn paths_except(&self, keep: Option<&str>) -> Vec<String> {
        self.session.read(|s| {
            s.loaded_overlays
                .keys()
                .filter(|path| Some(path.as_str()) != keep)
                .cloned()
                .collect()
        })
    }

    fn begin_load(&self, path: &str, display_name: &str, focus: bool) {
        let (ticket, color) = self.session.update(|s| {
            let color = colors::allocate(&s.colors_in_use(), s.loaded_overlays.len());
            let ticket = s.issue_ticket();
            s.loaded_overlays.insert(
                path.to_string(),
                OverlayRecord {
                    path: path.to_string(),
                    display_name: display_name.to_string(),
                    color,
                    renderer: None,
                    bounds: None,
                    stats: None,
                    load_ticket: ticket,
                },
            );
            if focus {
                s.focused_path = Some(path.to_string());
            }
            (ticket, color)
        });
        debug!(path = %path, color, ticket, "requesting overlay");

        let this = self.clone();
        let path = path.to_string();
        let task = self.runtime.spawn(async move {
            let style = OverlayStyle::track(color);
            let result = this.loader.materialize(&path, &style).await;
            this.finish_load(&path, ticket, result);
        });
        self.pending.lock().push(task);
    }

    fn finish_load(&self, path: &str, ticket: u64, result: AppResult<MaterializedOverlay>) {
        let overlay = match result {
            Ok(overlay) => overlay,
            Err(err) => {
                let current = self.session.read(|s| {
                    s.loaded_overlays
                        .get(path)
                        .is_some_and(|record| record.load_ticket == ticket)
                });
                if current {
                    warn!(path = %path, ?err, "overlay failed to load");
                    self.ui.overlay_failed(path, &err);
                } else {
                    debug!(path = %path, ?err, "stale overlay load failed");
                }
                return;
            }
        };

        let completion = self.session.update(|s| {
            let Some(record) = s
                .loaded_overlays
                .get_mut(path)
                .filter(|record| record.load_ticket == ticket)
            else {
                return Completion::Stale(overlay.handle);
            };
            record.renderer = Some(overlay.handle);
            record.bounds = Some(overlay.bounds);
            let panel = overlay.stats.info_panel(&record.display_name);
            record.stats = Some(overlay.stats);

            if s.focused_path.is_none() || s.is_focused(path) {
                s.focused_path = Some(path.to_string());
                Completion::Stored {
                    focus: Some((overlay.bounds, panel)),
                }
            } else {
                Completion::Stored { focus: None }
            }
        });

        match completion {
            Completion::Stale(handle) => {
                debug!(path = %path, ticket, "discarding overlay for superseded load");
                self.map.destroy_overlay(handle);
            }
            Completion::Stored { focus } => {
                if let Some((bounds, panel)) = focus {
                    self.map.fit_bounds(bounds);
                    self.ui.show_info_panel(&panel);
                }
                self.refresh_selection();
            }
        }
    }
}

fn panel_for(record: &OverlayRecord) -> Option<InfoPanel> {
    record
        .stats
        .as_ref()
        .map(|stats| stats.info_panel(&record.display_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colors::{primary_color, TRACK_PALETTE};
    use crate::test_support::{wait_for, FakeLoader, FakeMap, FakeUi};

    struct Harness {
        session: SessionHandle,
        map: Arc<FakeMap>,
        ui: Arc<FakeUi>,
        loader: Arc<FakeLoader>,
        manager: TrackOverlayManager,
    }

    fn harness(multi_mode: bool) -> Harness {
        let session = SessionHandle::default();
        session.update(|s| s.multi_mode = multi_mode);
        let map = Arc::new(FakeMap::default());
        let ui = Arc::new(FakeUi::default());
        let loader = Arc::new(FakeLoader::new(map.clone()));
        let manager = TrackOverlayManager::new(
            session.clone(),
            loader.clone(),
            map.clone(),
            ui.clone(),
            Handle::current(),
        );
        Harness {
            session,
            map,
            ui,
            loader,
            manager,
        }
    }

    #[tokio::test]
    async fn single_mode_never_holds_more_than_one_overlay() {
        let h = harness(false);
        for path in ["/a.gpx", "/b.gpx", "/c.gpx"] {
            h.manager.add_track(path, path);
            assert!(h.session.read(|s| s.loaded_overlays.len()) <= 1);
        }
        h.manager.settle().await;
        h.manager.remove_track("/c.gpx");
        assert_eq!(h.session.read(|s| s.loaded_overlays.len()), 0);
        assert_eq!(h.map.live_handles(), 0);
    }

    #[tokio::test]
    async fn adding_a_loaded_track_changes_nothing() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "A");
        h.manager.add_track("/b.gpx", "B");
        h.manager.settle().await;
        let before = h.session.read(|s| (s.loaded_overlays.len(), s.focused_path.clone()));

        h.manager.add_track("/b.gpx", "B");
        h.manager.settle().await;

        let after = h.session.read(|s| (s.loaded_overlays.len(), s.focused_path.clone()));
        assert_eq!(before, after);
        assert_eq!(h.loader.requests(), 2);
    }

    #[tokio::test]
    async fn colors_start_at_primary_and_stay_distinct() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "A");
        h.manager.add_track("/b.gpx", "B");
        let colors = h.session.read(|s| {
            s.loaded_overlays
                .values()
                .map(|r| r.color)
                .collect::<Vec<_>>()
        });
        assert_eq!(colors, vec![primary_color(), TRACK_PALETTE[1]]);

        h.manager.settle().await;
        h.manager.remove_track("/a.gpx");
        h.manager.add_track("/c.gpx", "C");
        let reused = h.session.read(|s| s.loaded_overlays["/c.gpx"].color);
        assert_eq!(reused, primary_color());
    }

    #[tokio::test]
    async fn first_loaded_overlay_takes_focus_and_frames_map() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "Alpha");
        h.manager.add_track("/b.gpx", "Beta");
        h.manager.settle().await;

        assert_eq!(
            h.session.read(|s| s.focused_path.clone()).as_deref(),
            Some("/a.gpx")
        );
        assert_eq!(h.map.fitted().len(), 1);
        assert_eq!(h.ui.last_panel().unwrap().name, "Alpha");
    }

    #[tokio::test]
    async fn removing_focused_overlay_focuses_the_remaining_one() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "Alpha");
        h.manager.add_track("/b.gpx", "Beta");
        h.manager.settle().await;

        h.manager.remove_track("/a.gpx");

        assert_eq!(
            h.session.read(|s| s.focused_path.clone()).as_deref(),
            Some("/b.gpx")
        );
        assert_eq!(h.ui.hidden_count(), 1);
        assert_eq!(h.ui.last_panel().unwrap().name, "Beta");
        assert_eq!(h.map.live_handles(), 1);
    }

    #[tokio::test]
    async fn late_completion_after_removal_destroys_its_handle() {
        let h = harness(true);
        let release = h.loader.hold("/slow.gpx");
        h.manager.add_track("/fast.gpx", "Fast");
        h.manager.add_track("/slow.gpx", "Slow");
        h.manager.remove_track("/slow.gpx");
        wait_for(|| h.session.read(|s| s.loaded_overlays["/fast.gpx"].is_materialized())).await;
        let focus_before = h.session.read(|s| s.focused_path.clone());

        release.send(()).unwrap();
        h.manager.settle().await;

        assert_eq!(h.map.live_handles(), 1);
        assert_eq!(h.map.destroyed().len(), 1);
        assert_eq!(h.session.read(|s| s.focused_path.clone()), focus_before);
        assert!(!h.session.read(|s| s.is_loaded("/slow.gpx")));
    }

    #[tokio::test]
    async fn reloaded_path_ignores_the_superseded_completion() {
        let h = harness(true);
        let first = h.loader.hold("/a.gpx");
        h.manager.add_track("/a.gpx", "A");
        h.manager.remove_track("/a.gpx");
        h.manager.add_track("/a.gpx", "A");
        first.send(()).unwrap();
        h.manager.settle().await;

        assert_eq!(h.loader.requests(), 2);
        assert_eq!(h.map.live_handles(), 1);
        assert!(h.session.read(|s| s.loaded_overlays["/a.gpx"].is_materialized()));
    }

    #[tokio::test]
    async fn failed_load_is_reported_and_record_stays_removable() {
        let h = harness(true);
        h.loader.fail("/broken.gpx");
        h.manager.add_track("/broken.gpx", "Broken");
        h.manager.settle().await;

        assert_eq!(h.ui.failures(), vec!["/broken.gpx".to_string()]);
        assert!(!h.session.read(|s| s.loaded_overlays["/broken.gpx"].is_materialized()));

        h.manager.remove_track("/broken.gpx");
        assert!(h.session.read(|s| s.loaded_overlays.is_empty()));
    }

    #[tokio::test]
    async fn focus_track_is_exclusive_and_reframes_loaded_track() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "A");
        h.manager.add_track("/b.gpx", "B");
        h.manager.settle().await;

        h.manager.focus_track("/b.gpx", "B");

        h.session.read(|s| {
            assert_eq!(s.loaded_overlays.len(), 1);
            assert!(s.is_focused("/b.gpx"));
        });
        assert_eq!(h.map.fitted().len(), 2);
        assert_eq!(h.ui.last_panel().unwrap().name, "B");
        assert_eq!(h.loader.requests(), 2);
    }

    #[tokio::test]
    async fn focus_on_unloaded_track_frames_it_once_loaded() {
        let h = harness(false);
        h.manager.focus_track("/a.gpx", "A");
        assert!(h.session.read(|s| s.is_focused("/a.gpx")));
        h.manager.settle().await;
        assert_eq!(h.map.fitted().len(), 1);
    }

    #[tokio::test]
    async fn visibility_toggle_only_acts_in_multi_mode() {
        let h = harness(false);
        h.manager.toggle_track_visibility("/a.gpx", "A", true);
        assert!(h.session.read(|s| s.loaded_overlays.is_empty()));

        h.manager.set_multi_mode(true);
        h.manager.toggle_track_visibility("/a.gpx", "A", true);
        h.manager.toggle_track_visibility("/b.gpx", "B", true);
        h.manager.settle().await;
        assert_eq!(h.session.read(|s| s.loaded_overlays.len()), 2);
        assert!(h.session.read(|s| s.is_focused("/a.gpx")));

        h.manager.toggle_track_visibility("/a.gpx", "A", false);
        assert_eq!(h.session.read(|s| s.loaded_overlays.len()), 1);
    }

    #[tokio::test]
    async fn leaving_multi_mode_keeps_only_the_focused_overlay() {
        let h = harness(true);
        for path in ["/a.gpx", "/b.gpx", "/c.gpx"] {
            h.manager.add_track(path, path);
        }
        h.manager.settle().await;
        h.manager.focus_track("/c.gpx", "/c.gpx");
        h.manager.set_multi_mode(true);
        h.manager.add_track("/d.gpx", "/d.gpx");
        h.manager.settle().await;

        h.manager.set_multi_mode(false);

        let paths = h
            .manager
            .selection()
            .into_iter()
            .map(|s| s.path)
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/c.gpx".to_string()]);
        assert_eq!(h.map.live_handles(), 1);
    }

    #[tokio::test]
    async fn reset_destroys_all_overlays() {
        let h = harness(true);
        h.manager.add_track("/a.gpx", "A");
        h.manager.add_track("/b.gpx", "B");
        h.manager.settle().await;

        h.manager.reset();

        h.session.read(|s| {
            assert!(s.loaded_overlays.is_empty());
            assert!(s.focused_path.is_none());
        });
        assert_eq!(h.map.live_handles(), 0);
    }

    #[test]
    fn tracks_can_be_added_from_outside_the_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let session = SessionHandle::default();
        let map = Arc::new(FakeMap::default());
        let ui = Arc::new(FakeUi::default());
        let loader = Arc::new(FakeLoader::new(map.clone()));
        let manager = TrackOverlayManager::new(
            session.clone(),
            loader,
            map.clone(),
            ui.clone(),
            runtime.handle().clone(),
        );

        manager.add_track("/a.gpx", "A");
        runtime.block_on(manager.settle());

        session.read(|s| {
            let record = &s.loaded_overlays["/a.gpx"];
            assert!(record.renderer.is_some());
            assert!(record.stats.is_some());
        });
        assert_eq!(map.live_handles(), 1);
        assert_eq!(ui.last_panel().unwrap().name, "A");
    }
}
