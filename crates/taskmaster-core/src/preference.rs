use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const DARK_MODE_KEY: &str = "darkMode";

/// String key-value persistence scoped to one client instance.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove_item(&self, key: &str) -> anyhow::Result<()>;
}

/// Key-value store kept as one JSON object on disk.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join("local_storage.json");
        debug!(file = %path.display(), "opened key-value store");
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing {}", self.path.display()))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, map)?;
        temp.flush()?;
        temp.persist(&self.path)
            .map_err(|err| anyhow!("failed to persist {}: {}", self.path.display(), err))?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get_item(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        match self.read_map() {
            Ok(mut map) => map.remove(key),
            Err(err) => {
                warn!(key, error = %err, "key-value store unreadable");
                None
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// In-process key-value store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }
}

/// Receives the theme side effect of a preference change.
pub trait ThemeMarker: Send + Sync {
    fn apply(&self, dark: bool);
}

/// Root-level dark flag the renderer reads to pick its palette.
#[derive(Debug, Clone, Default)]
pub struct RootMarker {
    dark: Arc<AtomicBool>,
}

impl RootMarker {
    pub fn is_dark(&self) -> bool {
        self.dark.load(Ordering::Relaxed)
    }
}

impl ThemeMarker for RootMarker {
    fn apply(&self, dark: bool) {
        self.dark.store(dark, Ordering::Relaxed);
    }
}

pub struct PreferenceStore {
    storage: Arc<dyn KeyValueStore>,
    marker: Arc<dyn ThemeMarker>,
    dark: AtomicBool,
}

impl PreferenceStore {
    /// Reads the persisted value and applies it to `marker`.
    pub fn load(storage: Arc<dyn KeyValueStore>, marker: Arc<dyn ThemeMarker>) -> Self {
        let dark = match storage.get_item(DARK_MODE_KEY) {
            Some(raw) => serde_json::from_str::<bool>(&raw).unwrap_or_else(|err| {
                warn!(raw = %raw, error = %err, "ignoring unparsable dark mode preference");
                false
            }),
            None => false,
        };
        marker.apply(dark);
        debug!(dark, "loaded dark mode preference");
        Self {
            storage,
            marker,
            dark: AtomicBool::new(dark),
        }
    }

    pub fn get(&self) -> bool {
        self.dark.load(Ordering::Relaxed)
    }

    pub fn set(&self, dark: bool) {
        self.dark.store(dark, Ordering::Relaxed);
        self.marker.apply(dark);
        let encoded = if dark { "true" } else { "false" };
        match self.storage.set_item(DARK_MODE_KEY, encoded) {
            Ok(()) => info!(dark, "dark mode preference saved"),
            Err(err) => warn!(dark, error = %err, "dark mode preference kept in memory only"),
        }
    }

    pub fn toggle(&self) -> bool {
        let next = !self.get();
        self.set(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{
        DARK_MODE_KEY, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, PreferenceStore,
        RootMarker,
    };

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get_item(&self, _key: &str) -> Option<String> {
            None
        }

        fn set_item(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("quota exceeded"))
        }

        fn remove_item(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn defaults_to_light_when_unset() {
        let marker = RootMarker::default();
        let prefs = PreferenceStore::load(
            Arc::new(MemoryKeyValueStore::default()),
            Arc::new(marker.clone()),
        );
        assert!(!prefs.get());
        assert!(!marker.is_dark());
    }

    #[test]
    fn set_updates_marker_and_storage() {
        let storage = Arc::new(MemoryKeyValueStore::default());
        let marker = RootMarker::default();
        let prefs = PreferenceStore::load(storage.clone(), Arc::new(marker.clone()));

        prefs.set(true);
        assert!(prefs.get());
        assert!(marker.is_dark());
        assert_eq!(storage.get_item(DARK_MODE_KEY).as_deref(), Some("true"));

        assert!(!prefs.toggle());
        assert_eq!(storage.get_item(DARK_MODE_KEY).as_deref(), Some("false"));
    }

    #[test]
    fn garbage_value_reads_as_false() {
        let storage = Arc::new(MemoryKeyValueStore::default());
        storage.set_item(DARK_MODE_KEY, "{nope").expect("seed");
        let prefs = PreferenceStore::load(storage, Arc::new(RootMarker::default()));
        assert!(!prefs.get());
    }

    #[test]
    fn failed_persist_keeps_value_in_memory() {
        let marker = RootMarker::default();
        let prefs = PreferenceStore::load(Arc::new(BrokenStore), Arc::new(marker.clone()));
        prefs.set(true);
        assert!(prefs.get());
        assert!(marker.is_dark());
    }

    #[test]
    fn unreadable_file_is_left_alone_on_write() {
        let temp = tempdir().expect("tempdir");
        let storage = FileKeyValueStore::open(temp.path());
        let path = temp.path().join("local_storage.json");
        fs::write(&path, "{\"session\": \"kept\",").expect("seed corrupt file");

        assert!(storage.set_item(DARK_MODE_KEY, "true").is_err());
        assert!(storage.remove_item("session").is_err());
        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "{\"session\": \"kept\","
        );

        let prefs = PreferenceStore::load(Arc::new(storage), Arc::new(RootMarker::default()));
        prefs.set(true);
        assert!(prefs.get());
    }
}
