use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::channel::{ProfileStore, TaskChannel};
use crate::config::Config;
use crate::datastore::DocumentStore;
use crate::engine::ReconciliationEngine;
use crate::preference::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, PreferenceStore, RootMarker,
};
use crate::session::{LocalAccount, LocalIdentityProvider, SessionGate};
use crate::view::{SyncSettings, TaskView};

/// Process-wide state, built once at startup and handed to whatever needs
/// it.
pub struct AppContext {
    pub config: Config,
    pub data_dir: PathBuf,
    pub store: Arc<DocumentStore>,
    pub preferences: Arc<PreferenceStore>,
    pub session: Arc<SessionGate>,
    pub theme: RootMarker,
    pub sync: SyncSettings,
}

impl AppContext {
    #[tracing::instrument(skip_all, fields(data_dir = %data_dir.display()))]
    pub fn init(config: Config, data_dir: &Path, account: LocalAccount) -> anyhow::Result<Self> {
        let sync = SyncSettings::from_config(&config).context("invalid sync settings")?;
        let store = Arc::new(
            DocumentStore::open(data_dir)
                .with_context(|| format!("failed to open document store at {}", data_dir.display()))?,
        );

        let storage: Arc<dyn KeyValueStore> = if config.get_bool("storage.local").unwrap_or(true) {
            Arc::new(FileKeyValueStore::open(data_dir))
        } else {
            debug!("local storage disabled; preferences last for this run only");
            Arc::new(MemoryKeyValueStore::default())
        };

        let theme = RootMarker::default();
        let preferences = Arc::new(PreferenceStore::load(
            storage.clone(),
            Arc::new(theme.clone()),
        ));

        let provider = Arc::new(LocalIdentityProvider::new(storage, account));
        let profiles: Arc<dyn ProfileStore> = store.clone();
        let session = Arc::new(SessionGate::new(provider, profiles));

        info!(dark = preferences.get(), "application context ready");
        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            preferences,
            session,
            theme,
            sync,
        })
    }

    pub fn channel(&self) -> Arc<dyn TaskChannel> {
        self.store.clone()
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(self.channel())
    }

    pub fn task_view(&self) -> TaskView {
        TaskView::new(
            self.engine(),
            self.session.clone(),
            self.preferences.clone(),
            self.sync,
        )
    }

    pub fn shutdown(self) {
        info!(data_dir = %self.data_dir.display(), "application context shut down");
    }
}
