use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::config::{ServerConfig, StorageConfig};

use super::ConnectionTarget;

/// SQL flavours the backend can speak. They share one schema and differ in
/// upsert syntax and how a connection is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    MySql,
    MariaDb,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Sqlite => "SQLite",
            Dialect::MySql => "MySQL",
            Dialect::MariaDb => "MariaDB",
        };
        f.write_str(name)
    }
}

const COLUMNS: &str = "uuid, sound, last_change, last_join";

impl Dialect {
    pub fn table_name(&self, config: &StorageConfig) -> String {
        let prefix = match self {
            Dialect::Sqlite => config.sqlite.table_prefix.clone(),
            Dialect::MySql => config.mysql.table_prefix.clone(),
            Dialect::MariaDb => config.mariadb.resolve(&config.mysql).table_prefix,
        };
        format!("{prefix}players")
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             uuid VARCHAR(36) PRIMARY KEY, \
             sound VARCHAR(255), \
             last_change BIGINT, \
             last_join BIGINT)"
        )
    }

    /// Idempotent write-or-replace keyed by `uuid`; binds uuid, sound, last_change, last_join.
    pub fn upsert_sql(&self, table: &str) -> String {
        match self {
            Dialect::Sqlite => format!(
                "INSERT INTO {table} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(uuid) DO UPDATE SET \
                 sound = excluded.sound, \
                 last_change = excluded.last_change, \
                 last_join = excluded.last_join"
            ),
            // Row alias form; VALUES() in this position is deprecated on MySQL 8.
            Dialect::MySql => format!(
                "INSERT INTO {table} ({COLUMNS}) VALUES (?, ?, ?, ?) AS new \
                 ON DUPLICATE KEY UPDATE \
                 sound = new.sound, \
                 last_change = new.last_change, \
                 last_join = new.last_join"
            ),
            Dialect::MariaDb => format!(
                "INSERT INTO {table} ({COLUMNS}) VALUES (?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                 sound = VALUES(sound), \
                 last_change = VALUES(last_change), \
                 last_join = VALUES(last_join)"
            ),
        }
    }

    pub fn select_all_sql(&self, table: &str) -> String {
        format!("SELECT {COLUMNS} FROM {table}")
    }

    pub fn delete_sql(&self, table: &str) -> String {
        format!("DELETE FROM {table} WHERE uuid = ?")
    }

    /// Build the address and credentials for this dialect's connection.
    pub fn target(&self, config: &StorageConfig, data_dir: &Path) -> ConnectionTarget {
        match self {
            Dialect::Sqlite => ConnectionTarget {
                url: data_dir
                    .join(&config.sqlite.file_name)
                    .to_string_lossy()
                    .into_owned(),
                username: String::new(),
                password: String::new(),
                connect_timeout: Duration::from_millis(config.flush_timeout_ms),
            },
            Dialect::MySql => server_target("mysql", &config.mysql),
            Dialect::MariaDb => server_target("mariadb", &config.mariadb.resolve(&config.mysql)),
        }
    }
}

fn server_target(scheme: &str, server: &ServerConfig) -> ConnectionTarget {
    ConnectionTarget {
        url: format!(
            "{scheme}://{}:{}/{}?useSSL={}&connectTimeout={}&autoReconnect=true",
            server.host, server.port, server.database, server.use_ssl, server.connect_timeout_ms
        ),
        username: server.username.clone(),
        password: server.password.clone(),
        connect_timeout: Duration::from_millis(server.connect_timeout_ms),
    }
}
