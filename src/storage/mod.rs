pub mod file;
pub mod sql;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StorageConfig;
use file::FileBackend;
use sql::{Dialect, DriverRegistry, SqlBackend};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No driver available for {0}")]
    DriverUnavailable(Dialect),
    #[error("Connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("Schema creation failed: {0}")]
    Schema(String),
    #[error("SQL error: {0}")]
    Sql(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid document {path}: {source}")]
    Document {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Batch partially written: {written} ok, {} failed", .failed.len())]
    PartialBatch {
        written: usize,
        failed: Vec<(Uuid, String)>,
    },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Which storage the configuration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "yaml", alias = "file")]
    Flat,
    #[serde(alias = "h2")]
    Sqlite,
    Mysql,
    #[serde(rename = "mariadb")]
    MariaDb,
}

impl BackendKind {
    pub fn dialect(self) -> Option<Dialect> {
        match self {
            BackendKind::Flat => None,
            BackendKind::Sqlite => Some(Dialect::Sqlite),
            BackendKind::Mysql => Some(Dialect::MySql),
            BackendKind::MariaDb => Some(Dialect::MariaDb),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Flat => "flat file",
            BackendKind::Sqlite => "SQLite",
            BackendKind::Mysql => "MySQL",
            BackendKind::MariaDb => "MariaDB",
        };
        f.write_str(name)
    }
}

/// One user's durable selection and timestamps (epoch seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceRecord {
    pub user: Uuid,
    pub signal: Option<String>,
    pub last_change: Option<i64>,
    pub last_triggered: Option<i64>,
}

impl PreferenceRecord {
    pub fn new(user: Uuid) -> Self {
        Self {
            user,
            signal: None,
            last_change: None,
            last_triggered: None,
        }
    }
}

/// A record exactly as storage holds it; the user id is not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub user: String,
    pub signal: Option<String>,
    pub last_change: Option<i64>,
    pub last_triggered: Option<i64>,
}

impl StoredRecord {
    /// Validate the identifier. Empty selections and zero timestamps mean "none".
    pub fn parse(self) -> std::result::Result<PreferenceRecord, String> {
        let user = Uuid::parse_str(self.user.trim()).map_err(|_| self.user.clone())?;
        Ok(PreferenceRecord {
            user,
            signal: self.signal.filter(|s| !s.is_empty()),
            last_change: self.last_change.filter(|&t| t > 0),
            last_triggered: self.last_triggered.filter(|&t| t > 0),
        })
    }
}

impl From<&PreferenceRecord> for StoredRecord {
    fn from(r: &PreferenceRecord) -> Self {
        Self {
            user: r.user.to_string(),
            signal: r.signal.clone(),
            last_change: r.last_change,
            last_triggered: r.last_triggered,
        }
    }
}

/// Everything one flush has to make durable.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    /// The whole map at the moment the flush started.
    pub snapshot: Vec<PreferenceRecord>,
    /// Records changed since the last successful flush.
    pub upserts: Vec<PreferenceRecord>,
    /// Users removed since the last successful flush.
    pub deletes: Vec<Uuid>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Raw durable storage of preference records. Implementations hold no
/// record state; the coordinator owns the map.
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human-readable location, e.g. a file path or connection URL.
    fn describe(&self) -> String;

    /// Full scan, used once at startup.
    fn load_all(&self) -> Result<Vec<StoredRecord>>;

    /// Write-or-replace by user id. Each record is written atomically.
    fn upsert_batch(&self, records: &[PreferenceRecord]) -> Result<usize>;

    /// Remove a user's record. Returns whether anything was removed.
    fn delete(&self, user: &Uuid) -> Result<bool>;

    /// Called when `load_all` failed at startup. Backends that rewrite their
    /// whole store on flush move the unreadable data out of the way and
    /// return where it went.
    fn set_aside_unreadable(&self, _stamp: i64) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Make one flush durable. Returns the number of backend write operations.
    fn apply(&self, batch: &FlushBatch) -> Result<usize> {
        let mut ops = 0;
        for user in &batch.deletes {
            self.delete(user)?;
            ops += 1;
        }
        if !batch.upserts.is_empty() {
            self.upsert_batch(&batch.upserts)?;
            ops += 1;
        }
        Ok(ops)
    }
}

/// A backend plus the reason it is not the one that was configured, if any.
pub struct OpenedBackend {
    pub backend: Box<dyn StorageBackend>,
    pub degraded: Option<String>,
}

/// Open the configured backend, degrading to the flat file when a SQL
/// backend cannot be initialized. Never fails on SQL trouble.
pub fn open_backend(
    config: &StorageConfig,
    data_dir: &Path,
    drivers: &DriverRegistry,
) -> Result<OpenedBackend> {
    let Some(dialect) = config.kind.dialect() else {
        let backend = FileBackend::open(data_dir.join(&config.flat.file_name))?;
        log::info!("Using {} storage for player data", config.kind);
        return Ok(OpenedBackend {
            backend: Box::new(backend),
            degraded: None,
        });
    };

    match SqlBackend::initialize(dialect, config, data_dir, drivers) {
        Ok(backend) => {
            log::info!("Using {} storage for player data", config.kind);
            Ok(OpenedBackend {
                backend: Box::new(backend),
                degraded: None,
            })
        }
        Err(e) => {
            log::error!(
                "{} storage unavailable ({e}); DEGRADED MODE: falling back to flat file storage",
                config.kind
            );
            let backend = FileBackend::open(data_dir.join(&config.flat.file_name))?;
            Ok(OpenedBackend {
                backend: Box::new(backend),
                degraded: Some(e.to_string()),
            })
        }
    }
}
