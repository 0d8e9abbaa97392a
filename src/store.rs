use log::{debug, info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CoreError, Result};
use crate::profile::{Config, ProfileItem};

const PROFILES_FILENAME: &str = "guiNConfig.json";

/// Persists the profile list and the selected profile id as one JSON document.
///
/// The loaded [`Config`] is cached; every mutation goes through the cache and
/// is written back with [`ProfileStore::save`].
pub struct ProfileStore {
    path: PathBuf,
    config: Mutex<Option<Config>>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: Mutex::new(None),
        }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(PROFILES_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cache(&self) -> MutexGuard<'_, Option<Config>> {
        // A poisoned cache still holds a consistent Config: every writer
        // replaces whole values.
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_document(&self) -> Result<Option<Config>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|source| CoreError::ConfigIo {
            path: self.path.clone(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| CoreError::ConfigParse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Reads the document from disk. A missing file produces (and persists) an
    /// empty config; unreadable documents are logged and treated as empty.
    pub fn load(&self) -> Config {
        let config = match self.read_document() {
            Ok(Some(config)) => config,
            Ok(None) => {
                info!("No profile document at {:?}, creating one", self.path);
                let config = Config::default();
                if let Err(e) = self.write_document(&config) {
                    warn!("Failed to persist empty profile document: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("Failed to load profiles, starting empty: {}", e);
                Config::default()
            }
        };
        *self.cache() = Some(config.clone());
        config
    }

    /// Writes `config` atomically and makes it the cached state.
    pub fn save(&self, config: &Config) -> Result<()> {
        self.write_document(config)?;
        *self.cache() = Some(config.clone());
        Ok(())
    }

    fn write_document(&self, config: &Config) -> Result<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CoreError::ConfigIo { path, source }
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let json = serde_json::to_string_pretty(config).map_err(|source| {
            CoreError::ConfigParse {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
            file.write_all(json.as_bytes()).map_err(io_err(&tmp_path))?;
            file.sync_all().map_err(io_err(&tmp_path))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;
        debug!("Saved {} profiles to {:?}", config.profile_items.len(), self.path);
        Ok(())
    }

    /// Runs `f` against the cached config (loading it first if needed) and
    /// persists the result. Save failures are logged, never returned.
    fn mutate<T>(&self, f: impl FnOnce(&mut Config) -> T) -> T {
        let mut guard = self.cache();
        if guard.is_none() {
            drop(guard);
            self.load();
            guard = self.cache();
        }
        let config = guard.get_or_insert_with(Config::default);
        let out = f(config);
        if let Err(e) = self.write_document(config) {
            warn!("Failed to save profiles: {}", e);
        }
        out
    }

    fn snapshot(&self) -> Config {
        if let Some(config) = self.cache().as_ref() {
            return config.clone();
        }
        self.load()
    }

    pub fn profiles(&self) -> Vec<ProfileItem> {
        self.snapshot().profile_items
    }

    pub fn get(&self, id: &str) -> Option<ProfileItem> {
        self.snapshot().find(id).cloned()
    }

    /// Replaces the profile with the same id or appends it. An empty id is
    /// replaced with a fresh one.
    pub fn upsert(&self, mut item: ProfileItem) -> ProfileItem {
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        let stored = item.clone();
        self.mutate(move |config| match config.find_mut(&item.id) {
            Some(existing) => *existing = item,
            None => config.profile_items.push(item),
        });
        stored
    }

    pub fn remove(&self, id: &str) {
        self.mutate(|config| {
            config.profile_items.retain(|p| p.id != id);
            if config.selected_profile_id == id {
                config.selected_profile_id.clear();
            }
        });
    }

    pub fn set_selected(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(CoreError::InvalidArgument(
                "selected profile id must not be empty".to_string(),
            ));
        }
        self.mutate(|config| config.selected_profile_id = id.to_string());
        Ok(())
    }

    pub fn selected(&self) -> Option<ProfileItem> {
        self.snapshot().selected().cloned()
    }

    /// Applies `f` to the profile with `id`. Returns false if it does not exist.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut ProfileItem)) -> bool {
        self.mutate(|config| match config.find_mut(id) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        })
    }

    /// Marks one listener (matched by port) and, when activating, the profile.
    pub fn set_listener_active(&self, id: &str, port: u16, active: bool) -> bool {
        self.update(id, |item| {
            for listener in item.listeners.iter_mut().filter(|l| l.port == port) {
                listener.is_active = active;
            }
            if active {
                item.is_running = true;
            }
        })
    }

    pub fn clear_runtime_flags(&self, id: &str) {
        self.update(id, ProfileItem::clear_runtime_flags);
    }

    pub fn clear_all_runtime_flags(&self) {
        self.mutate(|config| {
            for item in &mut config.profile_items {
                item.clear_runtime_flags();
            }
        });
    }
}
