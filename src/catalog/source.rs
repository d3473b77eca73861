//! Reading signal definitions from a YAML document.
//!
//! ```yaml
//! sounds:
//!   bell:
//!     display-name: "Bell Chime"
//!     audio-ref: "custom:join.bell"
//!     permission: joinsignal.sound.bell
//!     description: ["A gentle bell"]
//!     volume: 0.8
//!     seasonal: { start-date: "12-20", end-date: "01-05" }
//! aliases:
//!   chime: bell
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use super::SignalSpec;

#[derive(Error, Debug)]
pub enum CatalogSourceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid sound document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CatalogSourceError>;

/// Parsed document, ready for `SoundCatalog::load`.
#[derive(Debug, Clone, Default)]
pub struct CatalogSource {
    pub specs: Vec<SignalSpec>,
    pub aliases: Vec<(String, String)>,
    /// Entries that were not mappings at all.
    pub malformed: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
struct EntryDoc {
    display_name: Option<String>,
    audio_ref: Option<String>,
    permission: Option<String>,
    description: Vec<String>,
    volume: Option<f64>,
    pitch: Option<f64>,
    radius: Option<i64>,
    enabled: Option<bool>,
    hidden: Option<bool>,
    seasonal: Option<SeasonDoc>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
struct SeasonDoc {
    start_date: Option<String>,
    end_date: Option<String>,
}

impl CatalogSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogSourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text)?;
        let mut source = CatalogSource::default();

        match root.get("sounds").and_then(Value::as_mapping) {
            Some(sounds) => {
                for (key, entry) in sounds {
                    let Some(id) = scalar_key(key) else {
                        source.malformed += 1;
                        continue;
                    };
                    match Self::parse_entry(&id, entry) {
                        Some(spec) => source.specs.push(spec),
                        None => {
                            log::warn!("Invalid sound configuration for: {id}");
                            source.malformed += 1;
                        }
                    }
                }
            }
            None => log::warn!("No 'sounds' section found in sound document"),
        }

        if let Some(aliases) = root.get("aliases").and_then(Value::as_mapping) {
            source.aliases = Self::parse_aliases(aliases);
        }

        Ok(source)
    }

    fn parse_entry(id: &str, entry: &Value) -> Option<SignalSpec> {
        if !entry.is_mapping() {
            return None;
        }
        let doc: EntryDoc = match serde_yaml::from_value(entry.clone()) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("Sound '{id}' has invalid fields: {e}");
                return None;
            }
        };
        let season = doc.seasonal.unwrap_or_default();
        Some(SignalSpec {
            id: id.to_string(),
            display_name: doc.display_name,
            audio_ref: doc.audio_ref,
            permission: doc.permission,
            description: doc.description,
            volume: doc.volume,
            pitch: doc.pitch,
            radius: doc.radius,
            enabled: doc.enabled,
            hidden: doc.hidden,
            season_start: season.start_date,
            season_end: season.end_date,
        })
    }

    fn parse_aliases(aliases: &Mapping) -> Vec<(String, String)> {
        aliases
            .iter()
            .filter_map(|(alias, target)| match (scalar_key(alias), scalar_key(target)) {
                (Some(alias), Some(target)) => Some((alias, target)),
                (alias, _) => {
                    log::warn!("Ignoring malformed alias entry {alias:?}");
                    None
                }
            })
            .collect()
    }
}

/// YAML keys like `1up` or `2024` come through as numbers; ids are text.
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
