use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};

pub const PROVIDER_KEY: &str = "gpx-self-host-layer";
pub const THEME_KEY: &str = "gpx-self-hosted-theme";

/// Small string key-value store surviving restarts.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    /// Anything other than the two known names is ignored.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

pub fn persisted_theme(store: &dyn PreferenceStore) -> Option<Theme> {
    store.get(THEME_KEY).as_deref().and_then(Theme::parse)
}

pub fn persist_theme(store: &dyn PreferenceStore, theme: Theme) -> AppResult<()> {
    store.set(THEME_KEY, theme.as_str())
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PreferenceFile {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

impl PreferenceFile {
    fn load(path: &Path) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(file) => Ok(file),
                Err(err) => {
                    warn!(
                        target: "preferences",
                        error = ?err,
                        path = %path.display(),
                        "failed to parse preference file; starting empty"
                    );
                    Ok(Self::default())
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

/// Preferences kept in a pretty-printed JSON object on disk.
pub struct JsonPreferenceStore {
    path: PathBuf,
    entries: Mutex<PreferenceFile>,
}

impl JsonPreferenceStore {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let entries = PreferenceFile::load(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().entries.get(key).cloned()
    }

    /// The in-memory value only changes once the file has been written.
    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut file = self.entries.lock();
        let mut next = file.clone();
        next.entries.insert(key.to_string(), value.to_string());
        next.persist(&self.path)?;
        *file = next;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPreferenceStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn starts_empty_when_file_missing() {
        let dir = tempdir().unwrap();
        let store = JsonPreferenceStore::open(dir.path().join("prefs.json")).unwrap();
        assert_eq!(store.get(PROVIDER_KEY), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn persists_updates_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");
        let store = JsonPreferenceStore::open(&path).unwrap();
        store.set(PROVIDER_KEY, "osm").unwrap();
        persist_theme(&store, Theme::Dark).unwrap();

        let reopened = JsonPreferenceStore::open(&path).unwrap();
        assert_eq!(reopened.get(PROVIDER_KEY).as_deref(), Some("osm"));
        assert_eq!(persisted_theme(&reopened), Some(Theme::Dark));
    }

    #[test]
    fn failed_write_leaves_previous_value() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("blocked");
        let store = JsonPreferenceStore::open(parent.join("prefs.json")).unwrap();
        store.set(THEME_KEY, "light").unwrap();

        fs::remove_dir_all(&parent).unwrap();
        fs::write(&parent, "not a directory").unwrap();

        assert!(store.set(THEME_KEY, "dark").is_err());
        assert!(store.set(PROVIDER_KEY, "osm").is_err());
        assert_eq!(persisted_theme(&store), Some(Theme::Light));
        assert_eq!(store.get(PROVIDER_KEY), None);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonPreferenceStore::open(&path).unwrap();
        assert_eq!(store.get(PROVIDER_KEY), None);
    }

    #[test]
    fn unknown_theme_values_are_ignored() {
        let store = MemoryPreferenceStore::new();
        store.set(THEME_KEY, "sepia").unwrap();
        assert_eq!(persisted_theme(&store), None);
        store.set(THEME_KEY, "light").unwrap();
        assert_eq!(persisted_theme(&store), Some(Theme::Light));
    }
}
