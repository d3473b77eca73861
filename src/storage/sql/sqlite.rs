use std::path::Path;

use rusqlite::Connection;
use rusqlite::types::Value;

use super::{ConnectionTarget, SqlConnection, SqlDriver, SqlValue};
use crate::storage::{Result, StorageError, StoredRecord};

/// The driver bundled with the crate; `target.url` is a database file path.
#[derive(Debug, Default)]
pub struct SqliteDriver;

impl SqlDriver for SqliteDriver {
    fn name(&self) -> &str {
        "rusqlite"
    }

    fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlConnection>> {
        if let Some(parent) = Path::new(&target.url).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&target.url).map_err(|e| StorageError::Connect {
            target: target.url.clone(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(target.connect_timeout)?;
        // WAL mode so the startup scan doesn't block a concurrent flush
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Box::new(SqliteConnection { conn }))
    }
}

struct SqliteConnection {
    conn: Connection,
}

fn to_value(v: &SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

impl SqlConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let values: Vec<Value> = params.iter().map(to_value).collect();
        Ok(self.conn.execute(sql, rusqlite::params_from_iter(values))?)
    }

    fn query_records(&mut self, sql: &str) -> Result<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map([], |row| {
                Ok(StoredRecord {
                    user: row.get(0)?,
                    signal: row.get(1)?,
                    last_change: row.get(2)?,
                    last_triggered: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
