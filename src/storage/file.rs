//! Flat document storage: one YAML mapping keyed by user id.
//!
//! ```yaml
//! 069a79f4-44e9-4726-a5be-fca90e38aaf5:
//!   sound: bell
//!   last-change: 1718000000
//!   last-join: 1718003600
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use super::{
    BackendKind, FlushBatch, PreferenceRecord, Result, StorageBackend, StorageError, StoredRecord,
};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FlatEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_change: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_join: Option<i64>,
}

impl From<&PreferenceRecord> for FlatEntry {
    fn from(r: &PreferenceRecord) -> Self {
        Self {
            sound: r.signal.clone(),
            last_change: r.last_change,
            last_join: r.last_triggered,
        }
    }
}

/// Rewrites the whole document on every flush, via a temp file and rename.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Use `path`, creating the file (and its directory) when missing.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        if !path.exists() {
            std::fs::write(&path, "").map_err(|e| StorageError::io(&path, e))?;
            log::info!("Created {}", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_mapping(&self) -> Result<Mapping> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Mapping::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        if text.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str::<Value>(&text) {
            Ok(Value::Mapping(map)) => Ok(map),
            Ok(Value::Null) => Ok(Mapping::new()),
            Ok(_) => Err(StorageError::Document {
                path: self.path.clone(),
                source: serde::de::Error::custom("top level is not a mapping"),
            }),
            Err(source) => Err(StorageError::Document {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_text(&self, text: &str) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))
    }

    fn write_mapping(&self, map: &Mapping) -> Result<()> {
        let text = serde_yaml::to_string(map).map_err(|source| StorageError::Document {
            path: self.path.clone(),
            source,
        })?;
        self.write_text(&text)
    }

    fn write_records(&self, records: &[PreferenceRecord]) -> Result<()> {
        let doc: BTreeMap<String, FlatEntry> = records
            .iter()
            .map(|r| (r.user.to_string(), FlatEntry::from(r)))
            .collect();
        let text = serde_yaml::to_string(&doc).map_err(|source| StorageError::Document {
            path: self.path.clone(),
            source,
        })?;
        self.write_text(&text)
    }
}

/// Decode one entry. A wrongly typed field is dropped with a warning and the
/// fields that did parse are kept.
fn decode_entry(user: &str, value: Value, path: &Path) -> FlatEntry {
    let fields = match value {
        Value::Mapping(fields) => fields,
        Value::Null => return FlatEntry::default(),
        other => {
            log::warn!("Entry for {user} in {} is not a mapping: {other:?}", path.display());
            return FlatEntry::default();
        }
    };
    let field = |name: &str| -> Option<Value> { fields.get(name).cloned() };
    FlatEntry {
        sound: typed_field(user, "sound", field("sound"), path),
        last_change: typed_field(user, "last-change", field("last-change"), path),
        last_join: typed_field(user, "last-join", field("last-join"), path),
    }
}

fn typed_field<T: DeserializeOwned>(
    user: &str,
    name: &str,
    value: Option<Value>,
    path: &Path,
) -> Option<T> {
    match serde_yaml::from_value::<Option<T>>(value?) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Ignoring {name} for {user} in {}: {e}", path.display());
            None
        }
    }
}

fn key_text(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let map = self.read_mapping()?;
        let mut records = Vec::with_capacity(map.len());
        for (key, value) in map {
            let user = key_text(&key);
            let entry = decode_entry(&user, value, &self.path);
            records.push(StoredRecord {
                user,
                signal: entry.sound,
                last_change: entry.last_change,
                last_triggered: entry.last_join,
            });
        }
        Ok(records)
    }

    fn upsert_batch(&self, records: &[PreferenceRecord]) -> Result<usize> {
        let mut map = self.read_mapping()?;
        for r in records {
            let value = serde_yaml::to_value(FlatEntry::from(r)).map_err(|source| {
                StorageError::Document {
                    path: self.path.clone(),
                    source,
                }
            })?;
            map.insert(Value::String(r.user.to_string()), value);
        }
        self.write_mapping(&map)?;
        Ok(records.len())
    }

    fn delete(&self, user: &Uuid) -> Result<bool> {
        let mut map = self.read_mapping()?;
        let removed = map.remove(user.to_string().as_str()).is_some();
        if removed {
            self.write_mapping(&map)?;
        }
        Ok(removed)
    }

    /// Renames the document to `<name>.corrupt-<stamp>`; the next flush
    /// starts a fresh one.
    fn set_aside_unreadable(&self, stamp: i64) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".corrupt-{stamp}"));
        let target = self.path.with_file_name(name);
        std::fs::rename(&self.path, &target).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(Some(target))
    }

    /// The snapshot already reflects every delete, so one rewrite covers the batch.
    fn apply(&self, batch: &FlushBatch) -> Result<usize> {
        self.write_records(&batch.snapshot)?;
        Ok(1)
    }
}
