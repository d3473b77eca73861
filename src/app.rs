use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::source::CatalogSource;
use crate::catalog::{LoadReport, SoundCatalog};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::cooldown::CooldownTracker;
use crate::coordinator::{FlushError, FlushStats, PersistenceCoordinator};
use crate::storage::{self, sql::DriverRegistry};
use crate::store::PreferenceStore;
use crate::trigger::{ConnectHandler, Playback, Scheduler};

/// Everything built once at startup and handed to the host.
pub struct JoinSignals {
    settings: AppConfig,
    data_dir: PathBuf,
    catalog: Arc<SoundCatalog>,
    store: Arc<PreferenceStore>,
    connect: ConnectHandler,
}

impl JoinSignals {
    /// Load the catalog, open storage (degrading to the flat file if the
    /// configured database is unusable) and wire the handlers.
    pub fn start(
        settings: AppConfig,
        data_dir: &Path,
        source: CatalogSource,
        drivers: &DriverRegistry,
        clock: Arc<dyn Clock>,
        playback: Arc<dyn Playback>,
        scheduler: Arc<dyn Scheduler>,
    ) -> storage::Result<Self> {
        let catalog = Arc::new(SoundCatalog::new(settings.sounds.clone(), Arc::clone(&clock)));
        catalog.load(source.specs, source.aliases);

        let coordinator = Arc::new(PersistenceCoordinator::open(
            &settings.storage,
            data_dir,
            drivers,
            Arc::clone(&clock),
        )?);
        let cooldowns = CooldownTracker::new(settings.cooldowns.clone(), clock);
        let store = Arc::new(PreferenceStore::new(
            Arc::clone(&catalog),
            coordinator,
            cooldowns,
            settings.permissions.clone(),
        ));
        let connect = ConnectHandler::new(
            Arc::clone(&store),
            settings.general.clone(),
            settings.worlds.clone(),
            &settings.sounds,
            playback,
            scheduler,
        );

        log::info!(
            "JoinSignal ready: {} sounds, {} players",
            catalog.len(),
            store.coordinator().len()
        );
        Ok(Self {
            settings,
            data_dir: data_dir.to_path_buf(),
            catalog,
            store,
            connect,
        })
    }

    pub fn settings(&self) -> &AppConfig {
        &self.settings
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn catalog(&self) -> &Arc<SoundCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<PreferenceStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        self.store.coordinator()
    }

    pub fn connect(&self) -> &ConnectHandler {
        &self.connect
    }

    /// Swap in a new catalog generation. Stored selections are left alone;
    /// ones that no longer resolve are pruned on the user's next connect.
    pub fn reload_catalog(&self, source: CatalogSource) -> LoadReport {
        self.catalog.load(source.specs, source.aliases)
    }

    /// Bounded final flush.
    pub fn shutdown(&self) -> Result<FlushStats, FlushError> {
        let timeout = Duration::from_millis(self.settings.storage.flush_timeout_ms);
        let stats = self.coordinator().flush_now(timeout)?;
        log::info!(
            "Saved player data ({} flushes, {} failed)",
            stats.passes,
            stats.failures
        );
        Ok(stats)
    }
}
