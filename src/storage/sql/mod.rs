pub mod dialect;
pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::{
    BackendKind, PreferenceRecord, Result, StorageBackend, StorageError, StoredRecord,
};
use crate::config::StorageConfig;
pub use dialect::Dialect;
pub use sqlite::SqliteDriver;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub url: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

/// One open connection. Dropping it releases the underlying handle.
pub trait SqlConnection {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run a `SELECT uuid, sound, last_change, last_join` statement.
    fn query_records(&mut self, sql: &str) -> Result<Vec<StoredRecord>>;
}

/// Opens connections for one dialect.
pub trait SqlDriver: Send + Sync {
    fn name(&self) -> &str;
    fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlConnection>>;
}

/// Drivers the host has made available, by dialect.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Dialect, Arc<dyn SqlDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled SQLite driver.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Dialect::Sqlite, Arc::new(SqliteDriver));
        registry
    }

    pub fn register(&mut self, dialect: Dialect, driver: Arc<dyn SqlDriver>) {
        self.drivers.insert(dialect, driver);
    }

    /// MariaDB speaks the MySQL protocol, so a MySQL driver stands in for it.
    pub fn driver_for(&self, dialect: Dialect) -> Result<Arc<dyn SqlDriver>> {
        if let Some(driver) = self.drivers.get(&dialect) {
            return Ok(Arc::clone(driver));
        }
        if dialect == Dialect::MariaDb {
            if let Some(driver) = self.drivers.get(&Dialect::MySql) {
                log::warn!("MariaDB driver not found, using MySQL driver");
                return Ok(Arc::clone(driver));
            }
        }
        Err(StorageError::DriverUnavailable(dialect))
    }
}

/// Preference records in one `<prefix>players` table.
pub struct SqlBackend {
    dialect: Dialect,
    driver: Arc<dyn SqlDriver>,
    target: ConnectionTarget,
    table: String,
}

impl SqlBackend {
    /// Resolve the driver, check the connection and create the table if absent.
    pub fn initialize(
        dialect: Dialect,
        config: &StorageConfig,
        data_dir: &Path,
        drivers: &DriverRegistry,
    ) -> Result<Self> {
        let driver = drivers.driver_for(dialect)?;
        let backend = Self {
            dialect,
            driver,
            target: dialect.target(config, data_dir),
            table: dialect.table_name(config),
        };

        let mut conn = backend.connect()?;
        conn.execute(&dialect.create_table_sql(&backend.table), &[])
            .map_err(|e| StorageError::Schema(e.to_string()))?;
        log::debug!("Table {} created/verified", backend.table);
        Ok(backend)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        self.driver.connect(&self.target)
    }
}

fn upsert_params(r: &PreferenceRecord) -> [SqlValue; 4] {
    [
        SqlValue::Text(r.user.to_string()),
        r.signal.clone().map_or(SqlValue::Null, SqlValue::Text),
        SqlValue::Integer(r.last_change.unwrap_or(0)),
        SqlValue::Integer(r.last_triggered.unwrap_or(0)),
    ]
}

impl StorageBackend for SqlBackend {
    fn kind(&self) -> BackendKind {
        match self.dialect {
            Dialect::Sqlite => BackendKind::Sqlite,
            Dialect::MySql => BackendKind::Mysql,
            Dialect::MariaDb => BackendKind::MariaDb,
        }
    }

    fn describe(&self) -> String {
        format!("{} database {} ({})", self.dialect, self.target.url, self.table)
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let mut conn = self.connect()?;
        conn.query_records(&self.dialect.select_all_sql(&self.table))
    }

    fn upsert_batch(&self, records: &[PreferenceRecord]) -> Result<usize> {
        let mut conn = self.connect()?;
        let sql = self.dialect.upsert_sql(&self.table);
        let mut written = 0;
        let mut failed = Vec::new();
        for r in records {
            match conn.execute(&sql, &upsert_params(r)) {
                Ok(_) => written += 1,
                Err(e) => failed.push((r.user, e.to_string())),
            }
        }
        if failed.is_empty() {
            Ok(written)
        } else {
            Err(StorageError::PartialBatch { written, failed })
        }
    }

    fn delete(&self, user: &Uuid) -> Result<bool> {
        let mut conn = self.connect()?;
        let n = conn.execute(
            &self.dialect.delete_sql(&self.table),
            &[SqlValue::Text(user.to_string())],
        )?;
        Ok(n > 0)
    }
}
