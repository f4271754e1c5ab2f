//! Download-current-view job: confirm, run, settle.
//!
//! At most one job exists at a time and it lives in the session store. The
//! running request holds only its job id; whatever it reports back is dropped
//! once the store holds a different job (or none).

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{PrewarmSummary, PrewarmViewRequest, ViewerApi};
use crate::errors::{AppError, AppResult};
use crate::geo::{clamp_zoom, BoundsRect};
use crate::providers::ProviderConfig;
use crate::render::{MapSurface, PrewarmControlView, ViewerUi};
use crate::state::{JobStatus, PrewarmJobRecord, PrewarmOutcome, SessionHandle, SessionState};

const DEFAULT_MIN_ZOOM: u8 = 0;
const DEFAULT_MAX_ZOOM: u8 = 18;

pub const STATUS_LOADING_CONFIG: &str = "Loading map config…";
pub const STATUS_OFFLINE: &str = "Server is in offline mode.";
pub const STATUS_NO_PROVIDER: &str = "No active base layer.";
pub const STATUS_STARTING: &str = "Starting...";
pub const STATUS_CANCELED: &str = "Canceled.";
pub const STATUS_FAILED: &str = "Failed. Check console.";

/// What the user is asked to confirm.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmProposal {
    pub job_id: u64,
    pub provider_key: String,
    pub provider_name: String,
    pub zoom_min: u8,
    pub zoom_max: u8,
    pub bounds: Option<BoundsRect>,
}

impl PrewarmProposal {
    pub fn prompt(&self) -> String {
        confirm_prompt(&self.provider_name, self.zoom_min, self.zoom_max)
    }
}

fn confirm_prompt(provider_name: &str, zoom_min: u8, zoom_max: u8) -> String {
    format!("Download tiles for {provider_name} (zoom {zoom_min}–{zoom_max})?")
}

fn done_message(summary: &PrewarmSummary) -> String {
    format!("Done: {}/{} tiles saved.", summary.ok, summary.total)
}

/// Zoom window `[z - radius, z + radius]`, each end clamped to the provider.
pub fn zoom_window(center: i32, radius: u8, min_zoom: u8, max_zoom: u8) -> (u8, u8) {
    let radius = i32::from(radius);
    (
        clamp_zoom(center.saturating_sub(radius), min_zoom, max_zoom),
        clamp_zoom(center.saturating_add(radius), min_zoom, max_zoom),
    )
}

fn zoom_limits(config: &ProviderConfig, key: &str) -> (u8, u8) {
    config
        .provider(key)
        .map(|provider| (provider.min_zoom, provider.max_zoom))
        .unwrap_or((DEFAULT_MIN_ZOOM, DEFAULT_MAX_ZOOM))
}

/// Why a download cannot start right now, as shown in the status line.
fn unavailable_reason(state: &SessionState) -> Option<&'static str> {
    let Some(config) = state.provider_config.as_ref() else {
        return Some(STATUS_LOADING_CONFIG);
    };
    if config.offline {
        return Some(STATUS_OFFLINE);
    }
    if state.active_provider_key.is_none() {
        return Some(STATUS_NO_PROVIDER);
    }
    None
}

#[derive(Clone)]
pub struct PrewarmController {
    session: SessionHandle,
    api: Arc<dyn ViewerApi>,
    map: Arc<dyn MapSurface>,
    ui: Arc<dyn ViewerUi>,
    zoom_radius: u8,
}

impl PrewarmController {
    pub fn new(
        session: SessionHandle,
        api: Arc<dyn ViewerApi>,
        map: Arc<dyn MapSurface>,
        ui: Arc<dyn ViewerUi>,
        zoom_radius: u8,
    ) -> Self {
        Self {
            session,
            api,
            map,
            ui,
            zoom_radius,
        }
    }

    /// Idle to Confirming. No network activity happens here.
    pub fn request_download(&self) -> Option<PrewarmProposal> {
        let zoom = self.map.zoom();
        let bounds = self.map.bounds().and_then(|b| b.normalize().ok());
        let radius = self.zoom_radius;

        let proposal = self.session.update(|s| {
            if let Some(status) = s.prewarm_status() {
                debug!(?status, "download request ignored while a job exists");
                return None;
            }
            if let Some(reason) = unavailable_reason(s) {
                debug!(reason, "download request ignored");
                return None;
            }
            let config = s.provider_config.as_ref()?;
            let key = s.active_provider_key.clone()?;
            let (min_zoom, max_zoom) = zoom_limits(config, &key);
            let (zoom_min, zoom_max) = zoom_window(zoom, radius, min_zoom, max_zoom);
            let provider_name = config.display_name(&key).to_string();

            let id = s.issue_job_id();
            s.prewarm_job = Some(PrewarmJobRecord {
                id,
                status: JobStatus::Confirming,
                provider_key: key.clone(),
                zoom_min,
                zoom_max,
                proposed_bounds: bounds,
                cancel: None,
                progress: None,
                result: None,
                created_at: Utc::now(),
            });
            Some(PrewarmProposal {
                job_id: id,
                provider_key: key,
                provider_name,
                zoom_min,
                zoom_max,
                bounds,
            })
        });

        if let Some(proposal) = &proposal {
            info!(
                job_id = proposal.job_id,
                provider = %proposal.provider_key,
                zoom_min = proposal.zoom_min,
                zoom_max = proposal.zoom_max,
                "tile download awaiting confirmation"
            );
        }
        self.refresh_ui();
        proposal
    }

    /// Confirming to Idle.
    pub fn decline(&self) -> bool {
        let declined = self.session.update(|s| {
            if s.prewarm_status() != Some(JobStatus::Confirming) {
                return false;
            }
            s.prewarm_job = None;
            true
        });
        if declined {
            debug!("tile download declined");
            self.refresh_ui();
        }
        declined
    }

    /// Confirming to Running, then runs the request to a terminal state.
    /// Returns `None` when there was nothing to confirm or when the job was
    /// reset away before it finished.
    ///
    /// If the base layer changed while the prompt was open, the job switches
    /// to the active provider and its zoom window is recomputed against that
    /// provider's limits.
    pub async fn confirm(&self) -> Option<PrewarmOutcome> {
        let token = CancellationToken::new();
        let zoom = self.map.zoom();
        let radius = self.zoom_radius;
        let started = self.session.update(|s| {
            let switched = s
                .active_provider_key
                .clone()
                .filter(|key| s.prewarm_job.as_ref().is_some_and(|job| job.provider_key != *key))
                .map(|key| {
                    let (min_zoom, max_zoom) = s
                        .provider_config
                        .as_ref()
                        .map(|config| zoom_limits(config, &key))
                        .unwrap_or((DEFAULT_MIN_ZOOM, DEFAULT_MAX_ZOOM));
                    (key, zoom_window(zoom, radius, min_zoom, max_zoom))
                });
            let job = s
                .prewarm_job
                .as_mut()
                .filter(|job| job.status == JobStatus::Confirming)?;
            if let Some((key, (zoom_min, zoom_max))) = switched {
                debug!(
                    from = %job.provider_key,
                    to = %key,
                    zoom_min,
                    zoom_max,
                    "provider changed before confirm"
                );
                job.provider_key = key;
                job.zoom_min = zoom_min;
                job.zoom_max = zoom_max;
            }
            job.status = JobStatus::Running;
            job.cancel = Some(token.clone());
            job.progress = Some(0);
            let started = (job.id, job.provider_key.clone());
            s.prewarm_status_text = Some(STATUS_STARTING.to_string());
            Some(started)
        });
        let Some((job_id, provider_key)) = started else {
            debug!("confirm ignored without a pending confirmation");
            return None;
        };

        info!(job_id, provider = %provider_key, "tile download started");
        self.refresh_ui();

        let result = self.run(job_id, provider_key, &token).await;
        let outcome = self.settle(job_id, &token, result);
        self.refresh_ui();
        outcome
    }

    /// Aborts a running job, or declines a pending confirmation. Returns
    /// whether there was anything to cancel.
    pub fn cancel(&self) -> bool {
        let status = self.session.read(|s| {
            if let Some(token) = s.prewarm_job.as_ref().and_then(|job| job.cancel.as_ref()) {
                token.cancel();
            }
            s.prewarm_status()
        });
        match status {
            Some(JobStatus::Running) => {
                info!("tile download cancel requested");
                true
            }
            Some(JobStatus::Confirming) => self.decline(),
            _ => {
                debug!("cancel ignored while idle");
                false
            }
        }
    }

    pub fn view(&self) -> PrewarmControlView {
        self.session.read(|s| match s.prewarm_job.as_ref() {
            Some(job) if job.status == JobStatus::Running => PrewarmControlView {
                download_enabled: false,
                cancel_visible: true,
                confirm_text: None,
                status_text: s
                    .prewarm_status_text
                    .clone()
                    .unwrap_or_else(|| STATUS_STARTING.to_string()),
                progress_percent: job.progress,
            },
            Some(job) if job.status == JobStatus::Confirming => {
                let provider_name = s
                    .provider_config
                    .as_ref()
                    .map(|config| config.display_name(&job.provider_key).to_string())
                    .unwrap_or_else(|| job.provider_key.clone());
                PrewarmControlView {
                    download_enabled: false,
                    cancel_visible: false,
                    confirm_text: Some(confirm_prompt(&provider_name, job.zoom_min, job.zoom_max)),
                    status_text: s.prewarm_status_text.clone().unwrap_or_default(),
                    progress_percent: None,
                }
            }
            _ => idle_view(s),
        })
    }

    pub fn refresh_ui(&self) {
        let view = self.view();
        self.ui.render_prewarm_control(&view);
    }

    async fn run(
        &self,
        job_id: u64,
        provider_key: String,
        token: &CancellationToken,
    ) -> AppResult<PrewarmSummary> {
        let bounds = self
            .map
            .bounds()
            .ok_or_else(|| AppError::Bounds("map surface reported no viewport".into()))?
            .normalize()?;
        let request = PrewarmViewRequest {
            provider_key,
            bounds,
            center_zoom: self.map.zoom(),
            zoom_radius: self.zoom_radius,
        };
        let progress = |percent: u8| self.report_progress(job_id, percent);
        self.api.prewarm_view(&request, token, &progress).await
    }

    fn report_progress(&self, job_id: u64, percent: u8) {
        let current = self.session.update(|s| {
            match s
                .prewarm_job
                .as_mut()
                .filter(|job| job.id == job_id && job.status == JobStatus::Running)
            {
                Some(job) => {
                    job.progress = Some(percent);
                    true
                }
                None => false,
            }
        });
        if current {
            self.refresh_ui();
        }
    }

    fn settle(
        &self,
        job_id: u64,
        token: &CancellationToken,
        result: AppResult<PrewarmSummary>,
    ) -> Option<PrewarmOutcome> {
        let (status, summary, message) = match result {
            Ok(summary) => {
                let message = done_message(&summary);
                (JobStatus::Done, Some(summary), message)
            }
            Err(err) if err.is_cancellation() || token.is_cancelled() => {
                (JobStatus::Canceled, None, STATUS_CANCELED.to_string())
            }
            Err(err) => {
                error!(job_id, ?err, "tile download failed");
                (JobStatus::Failed, None, STATUS_FAILED.to_string())
            }
        };

        let outcome = self.session.update(|s| {
            if s.prewarm_job.as_ref().map(|job| job.id) != Some(job_id) {
                return None;
            }
            let mut job = s.prewarm_job.take()?;
            job.status = status;
            job.cancel = None;
            job.progress = None;
            job.result = summary;
            let outcome = PrewarmOutcome {
                job_id: job.id,
                status: job.status,
                provider_key: job.provider_key,
                summary: job.result,
                message: message.clone(),
                finished_at: Utc::now(),
            };
            s.prewarm_status_text = Some(message);
            s.last_prewarm_outcome = Some(outcome.clone());
            Some(outcome)
        });

        match &outcome {
            Some(outcome) => info!(job_id, status = ?outcome.status, "tile download settled"),
            None => debug!(job_id, ?status, "dropping result of a job that was reset"),
        }
        outcome
    }
}

fn idle_view(state: &SessionState) -> PrewarmControlView {
    let (download_enabled, status_text) = match unavailable_reason(state) {
        Some(reason) => (false, reason.to_string()),
        None => {
            let status = state.prewarm_status_text.clone().unwrap_or_else(|| {
                let key = state.active_provider_key.as_deref().unwrap_or_default();
                let name = state
                    .provider_config
                    .as_ref()
                    .map(|config| config.display_name(key))
                    .unwrap_or(key);
                format!("Ready ({name})")
            });
            (true, status)
        }
    };
    PrewarmControlView {
        download_enabled,
        cancel_visible: false,
        confirm_text: None,
        status_text,
        progress_percent: None,
    }
}
