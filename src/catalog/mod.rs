pub mod season;
pub mod source;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::config::SoundDefaults;
pub use season::SeasonalWindow;

pub const MIN_VOLUME: f64 = 0.0;
pub const MAX_VOLUME: f64 = 1.0;
pub const MIN_PITCH: f64 = 0.5;
pub const MAX_PITCH: f64 = 2.0;

/// A selectable signal after validation. Numeric fields are already clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    pub id: String,
    pub display_name: String,
    /// Backend-specific audio identifier handed to the playback layer.
    pub audio_ref: String,
    pub permission: String,
    pub description: Vec<String>,
    pub volume: f64,
    pub pitch: f64,
    pub radius: u32,
    pub enabled: bool,
    pub hidden: bool,
    pub seasonal: Option<SeasonalWindow>,
}

/// An unvalidated definition as read from configuration.
#[derive(Debug, Clone, Default)]
pub struct SignalSpec {
    pub id: String,
    pub display_name: Option<String>,
    pub audio_ref: Option<String>,
    pub permission: Option<String>,
    pub description: Vec<String>,
    pub volume: Option<f64>,
    pub pitch: Option<f64>,
    pub radius: Option<i64>,
    pub enabled: Option<bool>,
    pub hidden: Option<bool>,
    pub season_start: Option<String>,
    pub season_end: Option<String>,
}

impl SignalSpec {
    pub fn new(
        id: impl Into<String>,
        audio_ref: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            audio_ref: Some(audio_ref.into()),
            permission: Some(permission.into()),
            ..Default::default()
        }
    }

    /// Build the validated definition, or `None` when a required field is missing.
    fn validate(self, defaults: &SoundDefaults) -> Option<SignalDefinition> {
        let audio_ref = self.audio_ref.filter(|s| !s.trim().is_empty())?;
        let permission = self.permission.filter(|s| !s.trim().is_empty())?;

        let volume = self.volume.unwrap_or(defaults.volume);
        let pitch = self.pitch.unwrap_or(defaults.pitch);
        let radius = self.radius.unwrap_or(defaults.default_radius);
        let min_radius = defaults.min_radius.max(1);
        let max_radius = defaults.max_radius.max(min_radius);
        let seasonal = match (self.season_start, self.season_end) {
            (Some(start), Some(end)) => Some(SeasonalWindow::new(start, end)),
            _ => None,
        };

        Some(SignalDefinition {
            display_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            audio_ref,
            permission,
            description: self.description,
            volume: clamp_or(volume, MIN_VOLUME, MAX_VOLUME, defaults.volume),
            pitch: clamp_or(pitch, MIN_PITCH, MAX_PITCH, defaults.pitch),
            radius: radius.clamp(min_radius, max_radius).min(u32::MAX as i64) as u32,
            enabled: self.enabled.unwrap_or(true),
            hidden: self.hidden.unwrap_or(false),
            seasonal,
        })
    }
}

fn clamp_or(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback.clamp(min, max)
    } else {
        value.clamp(min, max)
    }
}

/// An alias pointing at a definition id in the same generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    /// Lowercased alias text.
    pub alias: String,
    pub target: String,
}

/// Counts from one `load`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub generation: u64,
    pub loaded: usize,
    pub skipped: usize,
    pub aliases: usize,
    pub dangling_aliases: usize,
}

/// One atomically published snapshot of definitions and aliases.
#[derive(Debug, Default)]
struct Generation {
    number: u64,
    sounds: HashMap<String, Arc<SignalDefinition>>,
    /// Maps lowercase alias → definition id
    aliases: HashMap<String, String>,
}

/// Resolves identifiers to signal definitions and applies availability rules.
pub struct SoundCatalog {
    current: ArcSwap<Generation>,
    /// Held for a whole `load` so generation numbers stay strictly increasing.
    reload: Mutex<()>,
    defaults: SoundDefaults,
    clock: Arc<dyn Clock>,
}

impl SoundCatalog {
    pub fn new(defaults: SoundDefaults, clock: Arc<dyn Clock>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::default()),
            reload: Mutex::new(()),
            defaults,
            clock,
        }
    }

    /// Replace the whole catalog. Readers see either the old generation or
    /// the new one, never a mix.
    pub fn load<A>(&self, specs: Vec<SignalSpec>, aliases: A) -> LoadReport
    where
        A: IntoIterator<Item = (String, String)>,
    {
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        let number = self.current.load().number + 1;
        let mut report = LoadReport {
            generation: number,
            ..Default::default()
        };

        let mut sounds: HashMap<String, Arc<SignalDefinition>> = HashMap::new();
        for spec in specs {
            let id = spec.id.clone();
            if sounds.contains_key(&id) {
                log::warn!("Duplicate sound id '{id}', keeping the first definition");
                report.skipped += 1;
                continue;
            }
            match spec.validate(&self.defaults) {
                Some(def) => {
                    log::debug!(
                        "Loaded sound: {} ({}, enabled={}, hidden={})",
                        def.id,
                        def.display_name,
                        def.enabled,
                        def.hidden
                    );
                    sounds.insert(id, Arc::new(def));
                }
                None => {
                    log::warn!("Failed to load sound: {id} (missing audio-ref or permission)");
                    report.skipped += 1;
                }
            }
        }

        let mut alias_map = HashMap::new();
        for (alias, target) in aliases {
            if sounds.contains_key(&target) {
                log::debug!("Loaded alias: {alias} -> {target}");
                alias_map.insert(alias.to_lowercase(), target);
            } else {
                log::warn!("Invalid alias '{alias}': sound '{target}' not found");
                report.dangling_aliases += 1;
            }
        }

        report.loaded = sounds.len();
        report.aliases = alias_map.len();
        self.current.store(Arc::new(Generation {
            number,
            sounds,
            aliases: alias_map,
        }));

        if report.skipped > 0 {
            log::info!(
                "Loaded {} sounds ({} skipped) and {} aliases",
                report.loaded,
                report.skipped,
                report.aliases
            );
        } else {
            log::info!("Loaded {} sounds and {} aliases", report.loaded, report.aliases);
        }
        report
    }

    /// Exact id first (case-sensitive), then alias (case-insensitive).
    pub fn resolve(&self, identifier: &str) -> Option<Arc<SignalDefinition>> {
        let generation = self.current.load();
        if let Some(def) = generation.sounds.get(identifier) {
            return Some(Arc::clone(def));
        }
        generation
            .aliases
            .get(&identifier.to_lowercase())
            .and_then(|id| generation.sounds.get(id))
            .map(Arc::clone)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.resolve(identifier).is_some()
    }

    pub fn is_available_for_selection(&self, def: &SignalDefinition) -> bool {
        def.enabled && !def.hidden && self.is_in_season(def)
    }

    pub fn is_in_season(&self, def: &SignalDefinition) -> bool {
        def.seasonal
            .as_ref()
            .is_none_or(|window| window.contains(self.clock.today()))
    }

    /// Selectable definitions the caller holds the permission for, by id.
    pub fn accessible_to(
        &self,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> BTreeMap<String, Arc<SignalDefinition>> {
        self.available()
            .into_iter()
            .filter(|(_, def)| has_permission(&def.permission))
            .collect()
    }

    /// Every definition that is currently selectable, by id.
    pub fn available(&self) -> BTreeMap<String, Arc<SignalDefinition>> {
        self.current
            .load()
            .sounds
            .iter()
            .filter(|(_, def)| self.is_available_for_selection(def))
            .map(|(id, def)| (id.clone(), Arc::clone(def)))
            .collect()
    }

    /// Every loaded definition regardless of availability, by id.
    pub fn all(&self) -> BTreeMap<String, Arc<SignalDefinition>> {
        self.current
            .load()
            .sounds
            .iter()
            .map(|(id, def)| (id.clone(), Arc::clone(def)))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.current.load().sounds.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn aliases(&self) -> Vec<AliasEntry> {
        let mut entries: Vec<AliasEntry> = self
            .current
            .load()
            .aliases
            .iter()
            .map(|(alias, target)| AliasEntry {
                alias: alias.clone(),
                target: target.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.alias.cmp(&b.alias));
        entries
    }

    pub fn len(&self) -> usize {
        self.current.load().sounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enabled_count(&self) -> usize {
        self.current.load().sounds.values().filter(|d| d.enabled).count()
    }

    /// Monotonic counter, bumped on every `load`.
    pub fn generation(&self) -> u64 {
        self.current.load().number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;

    fn catalog_on(y: i32, m: u32, d: u32) -> SoundCatalog {
        let clock = ManualClock::at_date(NaiveDate::from_ymd_opt(y, m, d).unwrap());
        SoundCatalog::new(SoundDefaults::default(), Arc::new(clock))
    }

    fn sample_specs() -> Vec<SignalSpec> {
        let mut hidden = SignalSpec::new("secret", "custom:secret", "js.sound.secret");
        hidden.hidden = Some(true);
        let mut off = SignalSpec::new("retired", "custom:retired", "js.sound.retired");
        off.enabled = Some(false);
        let mut winter = SignalSpec::new("sleigh", "custom:sleigh", "js.sound.sleigh");
        winter.season_start = Some("12-20".into());
        winter.season_end = Some("01-05".into());
        vec![
            SignalSpec::new("bell", "custom:bell", "js.sound.bell"),
            SignalSpec::new("horn", "custom:horn", "js.sound.vip"),
            hidden,
            off,
            winter,
        ]
    }

    #[test]
    fn test_resolve_alias_case_insensitive() {
        let cat = catalog_on(2024, 7, 1);
        cat.load(
            sample_specs(),
            vec![
                ("bell".to_string(), "bell".to_string()),
                ("Chime".to_string(), "bell".to_string()),
            ],
        );
        for ident in ["Bell", "bell", "BELL", "chime", "CHIME"] {
            let def = cat.resolve(ident).unwrap();
            assert_eq!(def.id, "bell", "identifier {ident}");
        }
        assert!(cat.resolve("gong").is_none());
    }

    #[test]
    fn test_exact_id_is_case_sensitive() {
        let cat = catalog_on(2024, 7, 1);
        cat.load(sample_specs(), Vec::new());
        assert!(cat.resolve("horn").is_some());
        assert!(cat.resolve("HORN").is_none());
    }

    #[test]
    fn test_skips_entries_missing_required_fields() {
        let cat = catalog_on(2024, 7, 1);
        let mut specs = sample_specs();
        specs.push(SignalSpec {
            id: "broken".into(),
            audio_ref: Some("custom:broken".into()),
            ..Default::default()
        });
        specs.push(SignalSpec {
            id: "blank".into(),
            audio_ref: Some("  ".into()),
            permission: Some("p".into()),
            ..Default::default()
        });
        let report = cat.load(specs, Vec::new());
        assert_eq!(report.loaded, 5);
        assert_eq!(report.skipped, 2);
        assert!(cat.resolve("broken").is_none());
    }

    #[test]
    fn test_dangling_alias_dropped() {
        let cat = catalog_on(2024, 7, 1);
        let report = cat.load(
            sample_specs(),
            vec![
                ("gone".to_string(), "missing".to_string()),
                ("b".to_string(), "bell".to_string()),
            ],
        );
        assert_eq!(report.aliases, 1);
        assert_eq!(report.dangling_aliases, 1);
        assert!(cat.resolve("gone").is_none());
    }

    #[test]
    fn test_values_clamped_at_load() {
        let cat = catalog_on(2024, 7, 1);
        let mut loud = SignalSpec::new("loud", "custom:loud", "p");
        loud.volume = Some(4.0);
        loud.pitch = Some(0.01);
        loud.radius = Some(500);
        let mut quiet = SignalSpec::new("quiet", "custom:quiet", "p");
        quiet.volume = Some(-1.0);
        quiet.radius = Some(0);
        cat.load(vec![loud, quiet], Vec::new());

        let loud = cat.resolve("loud").unwrap();
        assert_eq!(loud.volume, 1.0);
        assert_eq!(loud.pitch, 0.5);
        assert_eq!(loud.radius, 32);
        let quiet = cat.resolve("quiet").unwrap();
        assert_eq!(quiet.volume, 0.0);
        assert_eq!(quiet.radius, 5);
        assert_eq!(quiet.pitch, 1.0);
    }

    #[test]
    fn test_availability_rules() {
        let summer = catalog_on(2024, 7, 1);
        summer.load(sample_specs(), Vec::new());
        let ids: Vec<String> = summer.available().into_keys().collect();
        assert_eq!(ids, vec!["bell", "horn"]);

        let winter = catalog_on(2024, 12, 25);
        winter.load(sample_specs(), Vec::new());
        let ids: Vec<String> = winter.available().into_keys().collect();
        assert_eq!(ids, vec!["bell", "horn", "sleigh"]);
    }

    #[test]
    fn test_accessible_to_filters_by_permission() {
        let cat = catalog_on(2024, 7, 1);
        cat.load(sample_specs(), Vec::new());
        let accessible = cat.accessible_to(&|perm| perm == "js.sound.bell");
        assert_eq!(accessible.len(), 1);
        assert!(accessible.contains_key("bell"));
    }

    #[test]
    fn test_reload_replaces_generation() {
        let cat = catalog_on(2024, 7, 1);
        let first = cat.load(sample_specs(), vec![("b".to_string(), "bell".to_string())]);
        let second = cat.load(vec![SignalSpec::new("gong", "custom:gong", "p")], Vec::new());
        assert_eq!(second.generation, first.generation + 1);
        assert!(cat.resolve("bell").is_none());
        assert!(cat.resolve("b").is_none());
        assert!(cat.resolve("gong").is_some());
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn test_concurrent_loads_get_distinct_generations() {
        let cat = Arc::new(catalog_on(2024, 7, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cat = Arc::clone(&cat);
                std::thread::spawn(move || cat.load(sample_specs(), Vec::new()).generation)
            })
            .collect();
        let mut generations: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        generations.sort_unstable();
        assert_eq!(generations, (1..=8).collect::<Vec<u64>>());
        assert_eq!(cat.generation(), 8);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let cat = catalog_on(2024, 7, 1);
        let report = cat.load(
            vec![
                SignalSpec::new("bell", "custom:bell", "p"),
                SignalSpec::new("bell", "custom:other", "p"),
            ],
            Vec::new(),
        );
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(cat.resolve("bell").unwrap().audio_ref, "custom:bell");
    }

    #[test]
    fn test_counts() {
        let cat = catalog_on(2024, 7, 1);
        assert!(cat.is_empty());
        cat.load(sample_specs(), Vec::new());
        assert_eq!(cat.len(), 5);
        assert_eq!(cat.enabled_count(), 4);
        assert_eq!(cat.ids().first().map(String::as_str), Some("bell"));
    }
}
