use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::BoundsRect;
use crate::providers::ProviderConfig;

pub const LISTING_PATH: &str = "/api/gpx";
pub const TILE_CONFIG_PATH: &str = "/api/tile-config";
pub const PREWARM_PATH: &str = "/api/prewarm-view";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFile {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmViewRequest {
    pub provider_key: String,
    pub bounds: BoundsRect,
    pub center_zoom: i32,
    pub zoom_radius: u8,
}

/// Tile counts reported by the server for one pre-warm request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmSummary {
    pub provider_key: String,
    pub zoom_min: u8,
    pub zoom_max: u8,
    pub total: u64,
    pub ok: u64,
    pub failed: u64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait ViewerApi: Send + Sync {
    async fn list_tracks(&self) -> AppResult<Vec<TrackFile>>;

    async fn tile_config(&self) -> AppResult<ProviderConfig>;

    async fn fetch_track(&self, path: &str) -> AppResult<Vec<u8>>;

    /// Resolves with [`AppError::Canceled`] as soon as `cancel` fires; the
    /// in-flight request is dropped at that point.
    async fn prewarm_view(
        &self,
        request: &PrewarmViewRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> AppResult<PrewarmSummary>;
}

#[derive(Clone)]
pub struct HttpViewerApi {
    http: Client,
    base: Url,
}

impl HttpViewerApi {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let base = Url::parse(&config.api_base)
            .map_err(|err| AppError::Config(format!("invalid viewer API base URL: {err}")))?;
        let http = Client::builder()
            .user_agent(concat!("gpx-viewer/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self { http, base })
    }

    /// Appends `path` to the base URL, keeping any path prefix the base
    /// carries (a viewer mounted under `/viewer` serves `/viewer/api/gpx`).
    fn endpoint(&self, path: &str) -> AppResult<Url> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|err| AppError::Config(format!("invalid endpoint path {path}: {err}")))
    }

    fn check_status(url: &Url, response: &reqwest::Response) -> AppResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        warn!(endpoint = %url.path(), status = status.as_u16(), "viewer API returned an error");
        Err(AppError::Status {
            endpoint: url.path().to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl ViewerApi for HttpViewerApi {
    async fn list_tracks(&self) -> AppResult<Vec<TrackFile>> {
        let url = self.endpoint(LISTING_PATH)?;
        let response = self.http.get(url.clone()).send().await?;
        Self::check_status(&url, &response)?;
        // the server encodes an empty directory as null
        let files: Option<Vec<TrackFile>> = response.json().await?;
        Ok(files.unwrap_or_default())
    }

    async fn tile_config(&self) -> AppResult<ProviderConfig> {
        let url = self.endpoint(TILE_CONFIG_PATH)?;
        let response = self.http.get(url.clone()).send().await?;
        Self::check_status(&url, &response)?;
        Ok(response.json().await?)
    }

    async fn fetch_track(&self, path: &str) -> AppResult<Vec<u8>> {
        let url = self.endpoint(path)?;
        let response = self.http.get(url.clone()).send().await?;
        Self::check_status(&url, &response)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn prewarm_view(
        &self,
        request: &PrewarmViewRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> AppResult<PrewarmSummary> {
        let url = self.endpoint(PREWARM_PATH)?;
        let exchange = async {
            let response = self.http.post(url.clone()).json(request).send().await?;
            Self::check_status(&url, &response)?;
            progress(10);
            let summary: PrewarmSummary = response.json().await?;
            progress(100);
            Ok::<_, AppError>(summary)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider = %request.provider_key, "pre-warm request aborted");
                Err(AppError::Canceled)
            }
            result = exchange => result,
        }
    }
}
