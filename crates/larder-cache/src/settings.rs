//! User settings persisted outside the database.
//!
//! The timeline-cache switch lives in a small JSON file so that turning the
//! cache off still works when the database itself is unusable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Persisted user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub timeline_cache_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeline_cache_enabled: true,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults if the file is missing or corrupt.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read settings {}: {}", path.display(), e);
                return Self::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt settings {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Write settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Live, shared view of `timeline_cache_enabled`.
///
/// The store reads this before every timeline operation, so flipping it
/// takes effect immediately for in-flight sessions too.
#[derive(Debug, Clone)]
pub struct TimelineCacheFlag(Arc<AtomicBool>);

impl TimelineCacheFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

impl Default for TimelineCacheFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Settings file plus the live flag derived from it.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    path: PathBuf,
    flag: TimelineCacheFlag,
}

impl SettingsHandle {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load(&path);
        Self {
            path,
            flag: TimelineCacheFlag::new(settings.timeline_cache_enabled),
        }
    }

    pub fn flag(&self) -> TimelineCacheFlag {
        self.flag.clone()
    }

    pub fn current(&self) -> Settings {
        Settings {
            timeline_cache_enabled: self.flag.is_enabled(),
        }
    }

    /// Toggle the timeline cache and persist the change.
    ///
    /// The live flag changes even if saving fails.
    pub fn set_timeline_cache_enabled(&self, enabled: bool) -> Result<()> {
        self.flag.set(enabled);
        tracing::info!("Timeline cache {}", if enabled { "enabled" } else { "disabled" });
        self.current().save(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json"));
        assert!(settings.timeline_cache_enabled);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let handle = SettingsHandle::load(&path);
        let flag = handle.flag();
        assert!(flag.is_enabled());

        handle.set_timeline_cache_enabled(false).unwrap();
        assert!(!flag.is_enabled());

        let reloaded = SettingsHandle::load(&path);
        assert!(!reloaded.flag().is_enabled());
    }

    #[test]
    fn test_flag_clones_share_state() {
        let flag = TimelineCacheFlag::default();
        let other = flag.clone();
        other.set(false);
        assert!(!flag.is_enabled());
    }
}
