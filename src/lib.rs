pub mod app;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod coordinator;
pub mod storage;
pub mod store;
pub mod trigger;

/// Application name for XDG paths
pub const APP_NAME: &str = "joinsignal";

/// Sound definition document looked up in the data dir when none is given
pub const DEFAULT_SOUNDS_FILE: &str = "sounds.yml";
