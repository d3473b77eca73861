//! The preference contract used by command and connect handlers.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::{SignalDefinition, SoundCatalog};
use crate::config::PermissionConfig;
use crate::cooldown::{CooldownKind, CooldownTracker};
use crate::coordinator::PersistenceCoordinator;

/// Why a selection was refused. These are answers for the user, not faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    OnCooldown { remaining_seconds: i64 },
    UnknownSignal(String),
    /// Disabled or out of season.
    NotSelectable(String),
    PermissionDenied(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::OnCooldown { remaining_seconds } => write!(
                f,
                "You must wait {remaining_seconds} seconds before changing your join sound"
            ),
            Rejection::UnknownSignal(id) => write!(f, "Sound '{id}' not found"),
            Rejection::NotSelectable(id) => write!(f, "Sound '{id}' is not currently available"),
            Rejection::PermissionDenied(perm) => write!(f, "Missing permission {perm}"),
        }
    }
}

/// A stored selection.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub signal: Arc<SignalDefinition>,
    /// The selection this one replaced, if any.
    pub previous: Option<String>,
}

pub struct PreferenceStore {
    catalog: Arc<SoundCatalog>,
    coordinator: Arc<PersistenceCoordinator>,
    cooldowns: CooldownTracker,
    permissions: PermissionConfig,
}

impl PreferenceStore {
    /// Cooldown windows are seeded from the persisted timestamps so a
    /// restart does not reset them.
    pub fn new(
        catalog: Arc<SoundCatalog>,
        coordinator: Arc<PersistenceCoordinator>,
        cooldowns: CooldownTracker,
        permissions: PermissionConfig,
    ) -> Self {
        for record in coordinator.snapshot() {
            if let Some(at) = record.last_change {
                cooldowns.seed(record.user, CooldownKind::Change, at);
            }
            if let Some(at) = record.last_triggered {
                cooldowns.seed(record.user, CooldownKind::Rejoin, at);
            }
        }
        Self {
            catalog,
            coordinator,
            cooldowns,
            permissions,
        }
    }

    pub fn catalog(&self) -> &Arc<SoundCatalog> {
        &self.catalog
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Validate and store a selection. The canonical id is stored even when
    /// `identifier` is an alias.
    pub fn try_select(
        &self,
        user: Uuid,
        identifier: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> Result<Accepted, Rejection> {
        if !has_permission(&self.permissions.use_permission) {
            return Err(Rejection::PermissionDenied(
                self.permissions.use_permission.clone(),
            ));
        }
        let remaining_seconds = self.cooldowns.remaining_seconds(&user, CooldownKind::Change);
        if remaining_seconds > 0 {
            return Err(Rejection::OnCooldown { remaining_seconds });
        }
        let signal = self.selectable(identifier, has_permission)?;

        let previous = self.coordinator.get(&user);
        self.coordinator.set(user, &signal.id);
        self.cooldowns.record_event(user, CooldownKind::Change);
        log::debug!("{user} selected {}", signal.id);
        Ok(Accepted { signal, previous })
    }

    /// The definition a preview of `identifier` would play. Same checks as
    /// a selection, without the cooldown and without storing anything.
    pub fn preview_target(
        &self,
        identifier: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> Result<Arc<SignalDefinition>, Rejection> {
        if !has_permission(&self.permissions.use_permission) {
            return Err(Rejection::PermissionDenied(
                self.permissions.use_permission.clone(),
            ));
        }
        self.selectable(identifier, has_permission)
    }

    fn selectable(
        &self,
        identifier: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> Result<Arc<SignalDefinition>, Rejection> {
        // hidden signals are indistinguishable from missing ones
        let signal = match self.catalog.resolve(identifier) {
            Some(def) if !def.hidden => def,
            _ => return Err(Rejection::UnknownSignal(identifier.to_string())),
        };
        if !self.catalog.is_available_for_selection(&signal) {
            return Err(Rejection::NotSelectable(signal.id.clone()));
        }
        if !has_permission(&signal.permission) {
            return Err(Rejection::PermissionDenied(signal.permission.clone()));
        }
        Ok(signal)
    }

    pub fn current_selection(&self, user: &Uuid) -> Option<String> {
        self.coordinator.get(user)
    }

    /// Returns whether there was anything to clear.
    pub fn clear_selection(&self, user: &Uuid) -> bool {
        self.coordinator.remove(user)
    }

    /// The definition to play on connect, if every check passes. A selection
    /// whose signal no longer exists is removed.
    pub fn should_trigger(
        &self,
        user: &Uuid,
        world_enabled: bool,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> Option<Arc<SignalDefinition>> {
        let selected = self.coordinator.get(user)?;

        let Some(signal) = self.catalog.resolve(&selected) else {
            log::warn!("{user} has invalid sound {selected}, clearing it");
            self.coordinator.remove(user);
            return None;
        };
        if !self.catalog.is_available_for_selection(&signal) {
            log::debug!("Sound {} is not available, skipping {user}", signal.id);
            return None;
        }
        if !has_permission(&self.permissions.use_permission)
            || !has_permission(&signal.permission)
        {
            log::debug!("{user} lacks permission for {}", signal.id);
            return None;
        }
        if !world_enabled && !has_permission(&self.permissions.bypass_world_permission) {
            log::debug!("Join sounds disabled in {user}'s world");
            return None;
        }
        if self.cooldowns.is_on_cooldown(user, CooldownKind::Rejoin) {
            log::debug!("{user} rejoined within the cooldown, not playing");
            return None;
        }

        self.cooldowns.record_event(*user, CooldownKind::Rejoin);
        self.coordinator.mark_triggered(user);
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalSpec;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{CooldownConfig, SoundDefaults};
    use crate::storage::file::FileBackend;
    use chrono::NaiveDate;
    use std::time::Duration;

    struct Fixture {
        store: PreferenceStore,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn specs() -> Vec<SignalSpec> {
        let mut hidden = SignalSpec::new("secret", "custom:secret", "js.sound.secret");
        hidden.hidden = Some(true);
        let mut off = SignalSpec::new("retired", "custom:retired", "js.sound.retired");
        off.enabled = Some(false);
        vec![
            SignalSpec::new("bell", "custom:bell", "js.sound.bell"),
            SignalSpec::new("horn", "custom:horn", "js.sound.vip"),
            hidden,
            off,
        ]
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_date(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()));
        let catalog = Arc::new(SoundCatalog::new(SoundDefaults::default(), clock.clone()));
        catalog.load(specs(), vec![("chime".to_string(), "bell".to_string())]);
        let backend = FileBackend::open(dir.path().join("playerdata.yml")).unwrap();
        let coordinator = Arc::new(PersistenceCoordinator::new(Box::new(backend), clock.clone()));
        let cooldowns = CooldownTracker::new(CooldownConfig::default(), clock.clone());
        let store =
            PreferenceStore::new(catalog, coordinator, cooldowns, PermissionConfig::default());
        Fixture {
            store,
            clock,
            _dir: dir,
        }
    }

    fn everyone(_: &str) -> bool {
        true
    }

    #[test]
    fn test_select_round_trip() {
        let f = fixture();
        let user = Uuid::new_v4();
        let accepted = f.store.try_select(user, "bell", &everyone).unwrap();
        assert_eq!(accepted.signal.id, "bell");
        assert_eq!(accepted.previous, None);
        assert_eq!(f.store.current_selection(&user).as_deref(), Some("bell"));

        assert!(f.store.clear_selection(&user));
        assert_eq!(f.store.current_selection(&user), None);
        f.store.coordinator().flush_now(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_alias_stores_canonical_id() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "CHIME", &everyone).unwrap();
        assert_eq!(f.store.current_selection(&user).as_deref(), Some("bell"));
    }

    #[test]
    fn test_rejections() {
        let f = fixture();
        let user = Uuid::new_v4();
        assert_eq!(
            f.store.try_select(user, "gong", &everyone).unwrap_err(),
            Rejection::UnknownSignal("gong".into())
        );
        assert_eq!(
            f.store.try_select(user, "secret", &everyone).unwrap_err(),
            Rejection::UnknownSignal("secret".into())
        );
        assert_eq!(
            f.store.try_select(user, "retired", &everyone).unwrap_err(),
            Rejection::NotSelectable("retired".into())
        );
        let no_vip = |perm: &str| perm != "js.sound.vip";
        assert_eq!(
            f.store.try_select(user, "horn", &no_vip).unwrap_err(),
            Rejection::PermissionDenied("js.sound.vip".into())
        );
        let nobody = |_: &str| false;
        assert_eq!(
            f.store.try_select(user, "bell", &nobody).unwrap_err(),
            Rejection::PermissionDenied("joinsignal.use".into())
        );
        assert_eq!(f.store.current_selection(&user), None);
    }

    #[test]
    fn test_preview_target_ignores_cooldown() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        assert_eq!(f.store.preview_target("horn", &everyone).unwrap().id, "horn");
        assert_eq!(f.store.preview_target("chime", &everyone).unwrap().id, "bell");
        assert_eq!(
            f.store.preview_target("secret", &everyone).unwrap_err(),
            Rejection::UnknownSignal("secret".into())
        );
        // nothing stored
        assert_eq!(f.store.current_selection(&user).as_deref(), Some("bell"));
    }

    #[test]
    fn test_change_cooldown() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        f.clock.advance(10);
        assert_eq!(
            f.store.try_select(user, "horn", &everyone).unwrap_err(),
            Rejection::OnCooldown {
                remaining_seconds: 20
            }
        );
        f.clock.advance(20);
        let accepted = f.store.try_select(user, "horn", &everyone).unwrap();
        assert_eq!(accepted.previous.as_deref(), Some("bell"));
    }

    #[test]
    fn test_should_trigger_checks() {
        let f = fixture();
        let user = Uuid::new_v4();
        assert!(f.store.should_trigger(&user, true, &everyone).is_none());

        f.store.try_select(user, "horn", &everyone).unwrap();
        let no_vip = |perm: &str| perm != "js.sound.vip";
        assert!(f.store.should_trigger(&user, true, &no_vip).is_none());
        let no_bypass = |perm: &str| perm != "joinsignal.bypass.world";
        assert!(f.store.should_trigger(&user, false, &no_bypass).is_none());

        let def = f.store.should_trigger(&user, false, &everyone).unwrap();
        assert_eq!(def.id, "horn");
        let record = f.store.coordinator().record(&user).unwrap();
        assert_eq!(record.last_triggered, Some(f.clock.now()));
    }

    #[test]
    fn test_rejoin_cooldown() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        assert!(f.store.should_trigger(&user, true, &everyone).is_some());
        f.clock.advance(2);
        assert!(f.store.should_trigger(&user, true, &everyone).is_none());
        f.clock.advance(3);
        assert!(f.store.should_trigger(&user, true, &everyone).is_some());
    }

    #[test]
    fn test_dangling_selection_is_pruned() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "horn", &everyone).unwrap();
        f.store
            .catalog()
            .load(vec![SignalSpec::new("bell", "custom:bell", "p")], Vec::new());

        assert!(f.store.should_trigger(&user, true, &everyone).is_none());
        assert_eq!(f.store.current_selection(&user), None);
        assert!(f.store.coordinator().record(&user).is_none());
    }

    #[test]
    fn test_unavailable_selection_is_kept() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        let mut off = SignalSpec::new("bell", "custom:bell", "js.sound.bell");
        off.enabled = Some(false);
        f.store.catalog().load(vec![off], Vec::new());

        assert!(f.store.should_trigger(&user, true, &everyone).is_none());
        assert_eq!(f.store.current_selection(&user).as_deref(), Some("bell"));
    }

    #[test]
    fn test_cooldowns_seeded_from_storage() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        let coordinator = Arc::clone(f.store.coordinator());
        let catalog = Arc::clone(f.store.catalog());
        let cooldowns = CooldownTracker::new(CooldownConfig::default(), f.clock.clone());
        let restarted =
            PreferenceStore::new(catalog, coordinator, cooldowns, PermissionConfig::default());
        assert!(matches!(
            restarted.try_select(user, "horn", &everyone),
            Err(Rejection::OnCooldown { .. })
        ));
    }
}
