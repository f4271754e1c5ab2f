//! Session state store.
//!
//! Plain data plus a reset. All invariants about which overlay is focused,
//! how many overlays may be loaded and which job may run live in the
//! components that mutate this store, never in the store itself.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::PrewarmSummary;
use crate::geo::BoundsRect;
use crate::gpx::TrackStats;
use crate::providers::ProviderConfig;
use crate::render::{LayerId, RendererHandle};

#[derive(Debug)]
pub struct OverlayRecord {
    pub path: String,
    pub display_name: String,
    pub color: &'static str,
    /// Present once the map surface has materialized the overlay.
    pub renderer: Option<RendererHandle>,
    pub bounds: Option<BoundsRect>,
    pub stats: Option<TrackStats>,
    pub(crate) load_ticket: u64,
}

impl OverlayRecord {
    pub fn is_materialized(&self) -> bool {
        self.renderer.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Confirming,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Confirming | Self::Running)
    }
}

#[derive(Debug)]
pub struct PrewarmJobRecord {
    pub id: u64,
    pub status: JobStatus,
    pub provider_key: String,
    pub zoom_min: u8,
    pub zoom_max: u8,
    /// Viewport at the time of the request; the request itself reads the map
    /// again on confirm.
    pub proposed_bounds: Option<BoundsRect>,
    /// Only set while the job is running.
    pub cancel: Option<CancellationToken>,
    /// Last percentage reported by the running request.
    pub progress: Option<u8>,
    pub result: Option<PrewarmSummary>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmOutcome {
    pub job_id: u64,
    pub status: JobStatus,
    pub provider_key: String,
    pub summary: Option<PrewarmSummary>,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub loaded_overlays: IndexMap<String, OverlayRecord>,
    pub focused_path: Option<String>,
    pub multi_mode: bool,
    pub active_provider_key: Option<String>,
    pub provider_config: Option<ProviderConfig>,
    pub provider_layers: IndexMap<String, LayerId>,
    pub prewarm_job: Option<PrewarmJobRecord>,
    pub prewarm_status_text: Option<String>,
    pub last_prewarm_outcome: Option<PrewarmOutcome>,
    // Counters survive reset so stale continuations never match new work.
    next_ticket: u64,
    next_job_id: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn colors_in_use(&self) -> HashSet<&'static str> {
        self.loaded_overlays.values().map(|r| r.color).collect()
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.loaded_overlays.contains_key(path)
    }

    pub fn is_focused(&self, path: &str) -> bool {
        self.focused_path.as_deref() == Some(path)
    }

    pub fn prewarm_status(&self) -> Option<JobStatus> {
        self.prewarm_job.as_ref().map(|job| job.status)
    }

    pub(crate) fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    pub(crate) fn issue_job_id(&mut self) -> u64 {
        self.next_job_id += 1;
        self.next_job_id
    }

    /// Clears every field and cancels a running job. Renderer handles are
    /// handed back so the caller can destroy them on the map surface.
    pub fn reset(&mut self) -> Vec<RendererHandle> {
        if let Some(token) = self.prewarm_job.as_ref().and_then(|job| job.cancel.as_ref()) {
            token.cancel();
        }

        let handles = self
            .loaded_overlays
            .drain(..)
            .filter_map(|(_, record)| record.renderer)
            .collect::<Vec<_>>();

        info!(
            released_handles = handles.len(),
            had_job = self.prewarm_job.is_some(),
            "session state reset"
        );

        *self = Self {
            next_ticket: self.next_ticket,
            next_job_id: self.next_job_id,
            ..Self::default()
        };
        handles
    }
}

/// Shared handle to the session store. Closures passed to [`read`] and
/// [`update`] run under the lock and must not await.
///
/// [`read`]: SessionHandle::read
/// [`update`]: SessionHandle::update
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}
