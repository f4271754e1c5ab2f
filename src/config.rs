use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_PREFERENCES_FILE: &str = "viewer-preferences.json";
pub const DEFAULT_PREWARM_ZOOM_RADIUS: u8 = 2;
const MAX_PREWARM_ZOOM_RADIUS: u8 = 6;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base: String,
    pub http_timeout_ms: u64,
    pub preferences_file: String,
    pub prewarm_zoom_radius: u8,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub api_base: String,
    pub http_timeout_ms: u64,
    pub preferences_file: String,
    pub prewarm_zoom_radius: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            preferences_file: DEFAULT_PREFERENCES_FILE.to_string(),
            prewarm_zoom_radius: DEFAULT_PREWARM_ZOOM_RADIUS,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base: env::var("VIEWER_API_BASE")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http_timeout_ms: parse_u64("VIEWER_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS).max(1),
            preferences_file: env::var("VIEWER_PREFERENCES_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PREFERENCES_FILE.to_string()),
            prewarm_zoom_radius: parse_u8("VIEWER_PREWARM_ZOOM_RADIUS", DEFAULT_PREWARM_ZOOM_RADIUS)
                .min(MAX_PREWARM_ZOOM_RADIUS),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base: self.api_base.clone(),
            http_timeout_ms: self.http_timeout_ms,
            preferences_file: self.preferences_file.clone(),
            prewarm_zoom_radius: self.prewarm_zoom_radius,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u8(key: &str, default: u8) -> u8 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(default)
}
