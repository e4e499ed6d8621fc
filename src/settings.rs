//! Per-user settings cache
//!
//! Settings are loaded from the store once per user per process lifetime and
//! mutated in memory on navigation. Persistence is asynchronous and
//! best-effort: a failed write is logged and the in-memory value stands
//! (last-writer-wins against concurrent navigation).

use crate::error::RouterError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Setting recording the last-visited tree path, consulted by the `/`
/// redirect and updated on every `/tree/...` navigation.
pub const STARTUP_PATH_SETTING: &str = "startuppath";

/// Backing store for per-user settings
pub trait SettingsStore: Send + Sync + 'static {
    /// Load a user's settings. A user with no stored settings is an empty
    /// map, not an error.
    fn load(&self, user: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Persist a user's full settings map
    fn persist(&self, user: &str, settings: &HashMap<String, String>) -> anyhow::Result<()>;
}

/// Store keeping one JSON file per user under a settings directory
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn user_file(&self, user: &str) -> PathBuf {
        // User ids come from headers/cookies; keep only filename-safe chars.
        let safe: String = user
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self, user: &str) -> anyhow::Result<HashMap<String, String>> {
        let path = self.user_file(user);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, user: &str, settings: &HashMap<String, String>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(self.user_file(user), content)?;
        Ok(())
    }
}

/// Lazily-loaded, per-user settings cache over a [`SettingsStore`]
pub struct SettingsCache {
    store: Arc<dyn SettingsStore>,
    cache: DashMap<String, HashMap<String, String>>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Ensure the user's settings are loaded. Loads at most once per user
    /// per process lifetime.
    pub fn ensure_loaded(&self, user: &str) -> Result<(), RouterError> {
        if self.cache.contains_key(user) {
            return Ok(());
        }
        let settings = self
            .store
            .load(user)
            .map_err(|source| RouterError::SettingsLoad {
                user: user.to_string(),
                source,
            })?;
        debug!(user, count = settings.len(), "Loaded user settings");
        self.cache.entry(user.to_string()).or_insert(settings);
        Ok(())
    }

    /// Read a setting from the cache
    pub fn get(&self, user: &str, key: &str) -> Option<String> {
        self.cache.get(user).and_then(|s| s.get(key).cloned())
    }

    /// Update a setting in the cache and, when `persist` is set, flush the
    /// user's map to the store in the background. Persistence failures are
    /// logged only.
    pub fn update(self: &Arc<Self>, user: &str, key: &str, value: &str, persist: bool) {
        let snapshot = {
            let mut entry = self.cache.entry(user.to_string()).or_default();
            entry.insert(key.to_string(), value.to_string());
            persist.then(|| entry.clone())
        };

        if let Some(settings) = snapshot {
            let store = Arc::clone(&self.store);
            let user = user.to_string();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.persist(&user, &settings) {
                    warn!(user, error = %e, "Failed to persist user settings");
                }
            });
        }
    }
}
