use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::cache::CacheWindows;
use crate::feed::RevealWindows;
use crate::resolve::{Endpoint, DEFAULT_ENDPOINT, DEFAULT_RESOLVE_PATH};

pub const ENV_ENDPOINT: &str = "NEARCAST_PWS_ENDPOINT";
pub const ENV_DATA_DIR: &str = "NEARCAST_DATA_DIR";
pub const ENV_DEBUG: &str = "NEARCAST_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub pws_endpoint: String,
    pub resolve_path: String,
    pub api_key: Option<String>,
    pub ble_enabled: bool,
    pub fat_beacon_enabled: bool,
    pub mdns_enabled: bool,
    pub ssdp_enabled: bool,
    pub wifi_direct_enabled: bool,
    pub first_window_ms: u64,
    pub second_window_ms: u64,
    pub stale_window_ms: u64,
    pub local_stale_window_ms: u64,
    pub request_timeout_ms: u64,
    pub favorites: Vec<String>,
    pub blocked_hosts: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pws_endpoint: DEFAULT_ENDPOINT.into(),
            resolve_path: DEFAULT_RESOLVE_PATH.into(),
            api_key: None,
            ble_enabled: true,
            fat_beacon_enabled: false,
            mdns_enabled: true,
            ssdp_enabled: true,
            wifi_direct_enabled: false,
            first_window_ms: 2_000,
            second_window_ms: 10_000,
            stale_window_ms: 120_000,
            local_stale_window_ms: 30_000,
            request_timeout_ms: 10_000,
            favorites: Vec::new(),
            blocked_hosts: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.pws_endpoint, &self.resolve_path).with_api_key(self.api_key.clone())
    }

    pub fn reveal_windows(&self) -> RevealWindows {
        RevealWindows {
            first: Duration::from_millis(self.first_window_ms),
            second: Duration::from_millis(self.second_window_ms),
        }
    }

    pub fn cache_windows(&self) -> CacheWindows {
        CacheWindows {
            stale: Duration::from_millis(self.stale_window_ms),
            local_stale: Duration::from_millis(self.local_stale_window_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Environment overrides win over whatever the file says.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|value| !value.trim().is_empty()) {
            self.pws_endpoint = endpoint.trim().to_string();
        }
    }
}

/// `NEARCAST_DEBUG=1` or `true` turns on debug logging.
pub fn debug_enabled() -> bool {
    env::var(ENV_DEBUG)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

/// Where the settings file and the cache live.
pub fn data_dir() -> PathBuf {
    match env::var_os(ENV_DATA_DIR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => env::temp_dir().join("nearcast"),
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<EngineSettings>,
}

impl SettingsStore {
    /// A missing or unreadable file yields defaults rather than an error.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring corrupt settings in {}: {err}", path.display());
                EngineSettings::default()
            })
        } else {
            EngineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stored settings with environment overrides applied.
    pub fn effective(&self) -> EngineSettings {
        let mut settings = self.read().clone();
        settings.apply_env();
        settings
    }

    pub fn stored(&self) -> EngineSettings {
        self.read().clone()
    }

    pub fn update(&self, settings: EngineSettings) -> Result<()> {
        let mut guard = self.write();
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    pub fn set_endpoint(&self, base_url: &str, api_key: Option<String>) -> Result<()> {
        let mut settings = self.stored();
        settings.pws_endpoint = base_url.to_string();
        settings.api_key = api_key;
        self.update(settings)
    }

    fn persist(&self, data: &EngineSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
