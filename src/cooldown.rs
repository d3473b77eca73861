use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CooldownConfig;

/// Which action a cooldown window guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownKind {
    /// Changing the selected signal.
    Change,
    /// Connect-time playback.
    Rejoin,
}

/// Last-event timestamps per (user, kind). Entries are never removed;
/// once a window has passed they simply stop mattering.
pub struct CooldownTracker {
    config: CooldownConfig,
    clock: Arc<dyn Clock>,
    events: Mutex<HashMap<(Uuid, CooldownKind), i64>>,
}

impl CooldownTracker {
    pub fn new(config: CooldownConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            events: Mutex::new(HashMap::new()),
        }
    }

    fn events(&self) -> MutexGuard<'_, HashMap<(Uuid, CooldownKind), i64>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window_seconds(&self, kind: CooldownKind) -> i64 {
        match kind {
            CooldownKind::Change => self.config.change_seconds,
            CooldownKind::Rejoin => self.config.rejoin_seconds,
        }
    }

    pub fn is_on_cooldown(&self, user: &Uuid, kind: CooldownKind) -> bool {
        self.remaining_seconds(user, kind) > 0
    }

    /// Seconds until the window closes; 0 when disabled or never recorded.
    pub fn remaining_seconds(&self, user: &Uuid, kind: CooldownKind) -> i64 {
        if !self.config.enabled {
            return 0;
        }
        let Some(last) = self.events().get(&(*user, kind)).copied() else {
            return 0;
        };
        let elapsed = self.clock.now() - last;
        (self.window_seconds(kind) - elapsed).max(0)
    }

    pub fn record_event(&self, user: Uuid, kind: CooldownKind) {
        let now = self.clock.now();
        self.events().insert((user, kind), now);
    }

    /// Restore a timestamp read from storage. Newer in-memory events win.
    pub fn seed(&self, user: Uuid, kind: CooldownKind, at: i64) {
        let mut events = self.events();
        let slot = events.entry((user, kind)).or_insert(at);
        *slot = (*slot).max(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker(enabled: bool) -> (CooldownTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = CooldownConfig {
            enabled,
            change_seconds: 30,
            rejoin_seconds: 5,
        };
        (CooldownTracker::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_no_event_means_no_cooldown() {
        let (t, _) = tracker(true);
        let user = Uuid::new_v4();
        assert!(!t.is_on_cooldown(&user, CooldownKind::Change));
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Rejoin), 0);
    }

    #[test]
    fn test_remaining_counts_down_to_zero() {
        let (t, clock) = tracker(true);
        let user = Uuid::new_v4();
        t.record_event(user, CooldownKind::Change);
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 30);

        let mut previous = 30;
        for _ in 0..29 {
            clock.advance(1);
            let remaining = t.remaining_seconds(&user, CooldownKind::Change);
            assert!(remaining < previous);
            previous = remaining;
        }
        clock.advance(1);
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 0);
        clock.advance(100);
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 0);
        assert!(!t.is_on_cooldown(&user, CooldownKind::Change));
    }

    #[test]
    fn test_kinds_are_independent() {
        let (t, clock) = tracker(true);
        let user = Uuid::new_v4();
        t.record_event(user, CooldownKind::Rejoin);
        assert!(t.is_on_cooldown(&user, CooldownKind::Rejoin));
        assert!(!t.is_on_cooldown(&user, CooldownKind::Change));
        clock.advance(5);
        assert!(!t.is_on_cooldown(&user, CooldownKind::Rejoin));
    }

    #[test]
    fn test_disabled_never_on_cooldown() {
        let (t, _) = tracker(false);
        let user = Uuid::new_v4();
        t.record_event(user, CooldownKind::Change);
        assert!(!t.is_on_cooldown(&user, CooldownKind::Change));
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 0);
    }

    #[test]
    fn test_seed_keeps_newest() {
        let (t, _) = tracker(true);
        let user = Uuid::new_v4();
        t.seed(user, CooldownKind::Change, 990);
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 20);
        t.seed(user, CooldownKind::Change, 900);
        assert_eq!(t.remaining_seconds(&user, CooldownKind::Change), 20);
    }
}
