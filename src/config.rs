use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::storage::BackendKind;

pub const DEFAULT_TABLE_PREFIX: &str = "joinsignal_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub sounds: SoundDefaults,
    pub worlds: WorldPolicy,
    pub permissions: PermissionConfig,
    pub cooldowns: CooldownConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Master switch for connect-time playback.
    pub enabled: bool,
    /// Raise the default log filter to debug.
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
        }
    }
}

/// Defaults and bounds applied to every signal definition at catalog load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoundDefaults {
    pub default_radius: i64,
    pub min_radius: i64,
    pub max_radius: i64,
    pub volume: f64,
    pub pitch: f64,
    /// Delay between connect and playback, in milliseconds.
    pub play_delay_ms: i64,
    pub play_to_self: bool,
    /// Play a new selection back to the user who picked it.
    pub preview_on_select: bool,
}

impl Default for SoundDefaults {
    fn default() -> Self {
        Self {
            default_radius: 16,
            min_radius: 5,
            max_radius: 32,
            volume: 0.8,
            pitch: 1.0,
            play_delay_ms: 1000,
            play_to_self: true,
            preview_on_select: true,
        }
    }
}

/// Which worlds play signals. A non-empty `enabled` list wins over `disabled`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorldPolicy {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

impl WorldPolicy {
    pub fn is_enabled(&self, world: &str) -> bool {
        if !self.enabled.is_empty() {
            return self.enabled.iter().any(|w| w == world);
        }
        !self.disabled.iter().any(|w| w == world)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Required to select a signal or have one played on connect.
    pub use_permission: String,
    /// Plays signals even in worlds the policy disables.
    pub bypass_world_permission: String,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            use_permission: "joinsignal.use".to_string(),
            bypass_world_permission: "joinsignal.bypass.world".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub enabled: bool,
    /// Minimum seconds between selection changes.
    pub change_seconds: i64,
    /// Minimum seconds between connect-time playbacks.
    pub rejoin_seconds: i64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            change_seconds: 30,
            rejoin_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: BackendKind,
    /// Upper bound on the shutdown flush, in milliseconds.
    pub flush_timeout_ms: u64,
    pub flat: FlatConfig,
    pub sqlite: SqliteConfig,
    pub mysql: ServerConfig,
    pub mariadb: ServerOverrides,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Flat,
            flush_timeout_ms: 5000,
            flat: FlatConfig::default(),
            sqlite: SqliteConfig::default(),
            mysql: ServerConfig::default(),
            mariadb: ServerOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlatConfig {
    pub file_name: String,
}

impl Default for FlatConfig {
    fn default() -> Self {
        Self {
            file_name: "playerdata.yml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub file_name: String,
    pub table_prefix: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            file_name: "joinsignal.db".to_string(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
        }
    }
}

/// Connection parameters for a networked SQL server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub table_prefix: String,
    pub use_ssl: bool,
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: "minecraft".to_string(),
            username: "root".to_string(),
            password: String::new(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            use_ssl: false,
            connect_timeout_ms: 30_000,
        }
    }
}

/// MariaDB settings; anything left unset inherits the MySQL value.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub table_prefix: Option<String>,
    pub use_ssl: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
}

impl ServerOverrides {
    pub fn resolve(&self, base: &ServerConfig) -> ServerConfig {
        ServerConfig {
            host: self.host.clone().unwrap_or_else(|| base.host.clone()),
            port: self.port.unwrap_or(base.port),
            database: self.database.clone().unwrap_or_else(|| base.database.clone()),
            username: self.username.clone().unwrap_or_else(|| base.username.clone()),
            password: self.password.clone().unwrap_or_else(|| base.password.clone()),
            table_prefix: self
                .table_prefix
                .clone()
                .unwrap_or_else(|| base.table_prefix.clone()),
            use_ssl: self.use_ssl.unwrap_or(base.use_ssl),
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(base.connect_timeout_ms),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/joinsignal/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::read_default() {
            Ok(config) => config.validated(),
            Err(e) => {
                log::warn!("{e}. Using defaults.");
                Self::default()
            }
        }
    }

    /// Read and validate an explicit config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::read(path).map(AppConfig::validated)
    }

    /// Parse without validating, for callers that need a setting before
    /// logging is up. Call `validated()` afterwards.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<AppConfig>(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like `read`, for the XDG config path. A missing file gives defaults.
    pub fn read_default() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => {
                let config = Self::read(&path)?;
                log::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Clamp every numeric setting into range and repair unusable values.
    /// Each correction is logged; nothing here fails.
    pub fn validated(mut self) -> Self {
        let s = &mut self.sounds;
        if s.default_radius < 1 {
            log::warn!("Invalid default_radius {}, using 16", s.default_radius);
            s.default_radius = 16;
        }
        if s.min_radius < 1 {
            log::warn!("Invalid min_radius {}, using 1", s.min_radius);
            s.min_radius = 1;
        }
        if s.max_radius < s.default_radius {
            log::warn!(
                "max_radius {} is below default_radius {}, raising it",
                s.max_radius,
                s.default_radius
            );
            s.max_radius = s.default_radius;
        }
        if s.min_radius > s.max_radius {
            log::warn!("min_radius {} exceeds max_radius, lowering it", s.min_radius);
            s.min_radius = s.max_radius;
        }
        s.volume = clamp_logged("volume", s.volume, 0.0, 1.0);
        s.pitch = clamp_logged("pitch", s.pitch, 0.5, 2.0);
        if s.play_delay_ms < 0 {
            log::warn!("Negative play_delay_ms, playing immediately");
            s.play_delay_ms = 0;
        }

        let c = &mut self.cooldowns;
        if c.change_seconds < 0 {
            log::warn!("Negative change_seconds, using 0");
            c.change_seconds = 0;
        }
        if c.rejoin_seconds < 0 {
            log::warn!("Negative rejoin_seconds, using 0");
            c.rejoin_seconds = 0;
        }

        let st = &mut self.storage;
        repair_prefix(&mut st.sqlite.table_prefix);
        repair_prefix(&mut st.mysql.table_prefix);
        if let Some(prefix) = st.mariadb.table_prefix.as_mut() {
            repair_prefix(prefix);
        }

        self
    }

    /// Directory holding the flat document and the SQLite file.
    pub fn data_dir() -> PathBuf {
        if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
            let data_dir = dirs.data_dir();
            std::fs::create_dir_all(data_dir).ok();
            data_dir.to_path_buf()
        } else {
            // Fallback: current directory
            PathBuf::from(".")
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn clamp_logged(name: &str, value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        log::warn!("Invalid {name} (NaN), using {min}");
        return min;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::warn!("{name} {value} out of range [{min}, {max}], using {clamped}");
    }
    clamped
}

/// Table prefixes are spliced into SQL text, so only identifier characters pass.
fn repair_prefix(prefix: &mut String) {
    let valid = prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        log::warn!("Invalid table prefix '{prefix}', using '{DEFAULT_TABLE_PREFIX}'");
        *prefix = DEFAULT_TABLE_PREFIX.to_string();
    }
}
