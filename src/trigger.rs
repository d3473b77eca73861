//! Connect-time playback: decide, then play now or after the configured delay.
//! Previews go through the same `Playback` seam but only to the user.
//!
//! A delayed playback holds a ticket. Disconnecting (or connecting again)
//! replaces or drops the user's ticket, and a task that fires with a stale
//! ticket does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::catalog::SignalDefinition;
use crate::config::{GeneralConfig, SoundDefaults, WorldPolicy};
use crate::store::{Accepted, PreferenceStore, Rejection};

#[derive(Error, Debug)]
#[error("Playback failed: {0}")]
pub struct PlaybackError(pub String);

/// Who hears a playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Everyone within `radius` of the user.
    Nearby,
    /// The user alone. `radius` and `play_to_self` do not apply.
    SelfOnly,
}

/// Everything the host needs to emit a signal around a user.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub user: Uuid,
    pub signal_id: String,
    pub audio_ref: String,
    pub volume: f64,
    pub pitch: f64,
    pub radius: u32,
    /// Whether the connecting user hears their own signal.
    pub play_to_self: bool,
    pub audience: Audience,
}

impl PlaybackRequest {
    fn nearby(user: Uuid, signal: &SignalDefinition, play_to_self: bool) -> Self {
        Self {
            user,
            signal_id: signal.id.clone(),
            audio_ref: signal.audio_ref.clone(),
            volume: signal.volume,
            pitch: signal.pitch,
            radius: signal.radius,
            play_to_self,
            audience: Audience::Nearby,
        }
    }

    fn self_only(user: Uuid, signal: &SignalDefinition) -> Self {
        Self {
            audience: Audience::SelfOnly,
            play_to_self: true,
            ..Self::nearby(user, signal, true)
        }
    }
}

/// Host-side audio emission. Falling back to a built-in cue when
/// `audio_ref` cannot be resolved is up to the implementation.
pub trait Playback: Send + Sync {
    fn play(&self, request: &PlaybackRequest) -> Result<(), PlaybackError>;
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task);
}

/// One short-lived thread per scheduled task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let spawned = thread::Builder::new()
            .name("joinsignal-delay".to_string())
            .spawn(move || {
                thread::sleep(delay);
                task();
            });
        if let Err(e) = spawned {
            log::error!("Could not schedule delayed playback: {e}");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Playback is switched off globally.
    Disabled,
    /// No selection, or a check refused it.
    Skipped,
    Played(PlaybackRequest),
    Scheduled {
        request: PlaybackRequest,
        ticket: u64,
        delay: Duration,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewOutcome {
    Played(PlaybackRequest),
    Refused(Rejection),
    Failed(String),
}

type Tickets = Arc<Mutex<HashMap<Uuid, u64>>>;

fn lock(tickets: &Tickets) -> MutexGuard<'_, HashMap<Uuid, u64>> {
    tickets.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectHandler {
    store: Arc<PreferenceStore>,
    general: GeneralConfig,
    worlds: WorldPolicy,
    delay: Duration,
    play_to_self: bool,
    preview_on_select: bool,
    playback: Arc<dyn Playback>,
    scheduler: Arc<dyn Scheduler>,
    pending: Tickets,
    next_ticket: AtomicU64,
}

impl ConnectHandler {
    pub fn new(
        store: Arc<PreferenceStore>,
        general: GeneralConfig,
        worlds: WorldPolicy,
        sounds: &SoundDefaults,
        playback: Arc<dyn Playback>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            store,
            general,
            worlds,
            delay: Duration::from_millis(sounds.play_delay_ms.max(0) as u64),
            play_to_self: sounds.play_to_self,
            preview_on_select: sounds.preview_on_select,
            playback,
            scheduler,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn on_connect(
        &self,
        user: Uuid,
        world: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> ConnectOutcome {
        if !self.general.enabled {
            return ConnectOutcome::Disabled;
        }
        let world_enabled = self.worlds.is_enabled(world);
        let Some(signal) = self.store.should_trigger(&user, world_enabled, has_permission) else {
            return ConnectOutcome::Skipped;
        };

        let request = PlaybackRequest::nearby(user, &signal, self.play_to_self);

        if self.delay.is_zero() {
            return match self.playback.play(&request) {
                Ok(()) => {
                    log::debug!("Played {} for {user}", request.signal_id);
                    ConnectOutcome::Played(request)
                }
                Err(e) => {
                    log::error!("Error playing join sound for {user}: {e}");
                    ConnectOutcome::Failed(e.to_string())
                }
            };
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(user, ticket);

        let pending = Arc::clone(&self.pending);
        let playback = Arc::clone(&self.playback);
        let task_request = request.clone();
        self.scheduler.schedule(
            self.delay,
            Box::new(move || {
                let current = {
                    let mut tickets = lock(&pending);
                    if tickets.get(&user) == Some(&ticket) {
                        tickets.remove(&user);
                        true
                    } else {
                        false
                    }
                };
                if !current {
                    log::debug!("Dropping stale playback ticket {ticket} for {user}");
                    return;
                }
                if let Err(e) = playback.play(&task_request) {
                    log::error!("Error playing join sound for {user}: {e}");
                }
            }),
        );

        ConnectOutcome::Scheduled {
            request,
            ticket,
            delay: self.delay,
        }
    }

    /// Play a signal to `user` alone. Runs the selection checks but stores
    /// nothing and ignores the change cooldown.
    pub fn preview(
        &self,
        user: Uuid,
        identifier: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> PreviewOutcome {
        let signal = match self.store.preview_target(identifier, has_permission) {
            Ok(signal) => signal,
            Err(rejection) => return PreviewOutcome::Refused(rejection),
        };
        let request = PlaybackRequest::self_only(user, &signal);
        match self.playback.play(&request) {
            Ok(()) => PreviewOutcome::Played(request),
            Err(e) => {
                log::warn!("Failed to preview {} for {user}: {e}", signal.id);
                PreviewOutcome::Failed(e.to_string())
            }
        }
    }

    /// Store a selection, then preview it to the user when `preview_on_select`
    /// is on. A failed preview does not undo the selection.
    pub fn select(
        &self,
        user: Uuid,
        identifier: &str,
        has_permission: &dyn Fn(&str) -> bool,
    ) -> Result<Accepted, Rejection> {
        let accepted = self.store.try_select(user, identifier, has_permission)?;
        if self.preview_on_select {
            let request = PlaybackRequest::self_only(user, &accepted.signal);
            if let Err(e) = self.playback.play(&request) {
                log::warn!("Failed to preview {} for {user}: {e}", request.signal_id);
            }
        }
        Ok(accepted)
    }

    /// Cancel any pending playback. Returns whether one was pending.
    pub fn on_disconnect(&self, user: &Uuid) -> bool {
        lock(&self.pending).remove(user).is_some()
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SignalSpec, SoundCatalog};
    use crate::clock::ManualClock;
    use crate::config::{CooldownConfig, PermissionConfig};
    use crate::cooldown::CooldownTracker;
    use crate::coordinator::PersistenceCoordinator;
    use crate::storage::file::FileBackend;

    #[derive(Default)]
    struct RecordingPlayback {
        played: Mutex<Vec<PlaybackRequest>>,
        fail: bool,
    }

    impl Playback for RecordingPlayback {
        fn play(&self, request: &PlaybackRequest) -> Result<(), PlaybackError> {
            if self.fail {
                return Err(PlaybackError("unknown sound key".into()));
            }
            self.played.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    /// Holds tasks until the test runs them.
    #[derive(Default)]
    struct ManualScheduler {
        tasks: Mutex<Vec<(Duration, Task)>>,
    }

    impl ManualScheduler {
        fn run_all(&self) {
            let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
            for (_, task) in tasks {
                task();
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: Task) {
            self.tasks.lock().unwrap().push((delay, task));
        }
    }

    struct Fixture {
        handler: ConnectHandler,
        store: Arc<PreferenceStore>,
        playback: Arc<RecordingPlayback>,
        scheduler: Arc<ManualScheduler>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture(delay_ms: i64, fail: bool, worlds: WorldPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let sounds = SoundDefaults {
            play_delay_ms: delay_ms,
            ..Default::default()
        };
        let catalog = Arc::new(SoundCatalog::new(sounds.clone(), clock.clone()));
        let mut bell = SignalSpec::new("bell", "custom:bell", "js.sound.bell");
        bell.volume = Some(0.5);
        catalog.load(vec![bell], Vec::new());
        let backend = FileBackend::open(dir.path().join("playerdata.yml")).unwrap();
        let coordinator = Arc::new(PersistenceCoordinator::new(Box::new(backend), clock.clone()));
        let cooldowns = CooldownTracker::new(CooldownConfig::default(), clock.clone());
        let store = Arc::new(PreferenceStore::new(
            catalog,
            coordinator,
            cooldowns,
            PermissionConfig::default(),
        ));
        let playback = Arc::new(RecordingPlayback {
            fail,
            ..Default::default()
        });
        let scheduler = Arc::new(ManualScheduler::default());
        let handler = ConnectHandler::new(
            Arc::clone(&store),
            GeneralConfig::default(),
            worlds,
            &sounds,
            playback.clone(),
            scheduler.clone(),
        );
        Fixture {
            handler,
            store,
            playback,
            scheduler,
            clock,
            _dir: dir,
        }
    }

    fn everyone(_: &str) -> bool {
        true
    }

    #[test]
    fn test_immediate_playback() {
        let f = fixture(0, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        assert_eq!(f.handler.on_connect(user, "world", &everyone), ConnectOutcome::Skipped);

        f.store.try_select(user, "bell", &everyone).unwrap();
        match f.handler.on_connect(user, "world", &everyone) {
            ConnectOutcome::Played(req) => {
                assert_eq!(req.audio_ref, "custom:bell");
                assert_eq!(req.volume, 0.5);
                assert_eq!(req.radius, 16);
                assert!(req.play_to_self);
                assert_eq!(req.audience, Audience::Nearby);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_delayed_playback_fires() {
        let f = fixture(1000, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();

        let outcome = f.handler.on_connect(user, "world", &everyone);
        assert!(matches!(
            outcome,
            ConnectOutcome::Scheduled { delay, .. } if delay == Duration::from_secs(1)
        ));
        assert!(f.playback.played.lock().unwrap().is_empty());
        assert_eq!(f.handler.pending(), 1);

        f.scheduler.run_all();
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);
        assert_eq!(f.handler.pending(), 0);
    }

    #[test]
    fn test_disconnect_cancels_pending() {
        let f = fixture(1000, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        f.handler.on_connect(user, "world", &everyone);

        assert!(f.handler.on_disconnect(&user));
        assert!(!f.handler.on_disconnect(&user));
        f.scheduler.run_all();
        assert!(f.playback.played.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reconnect_supersedes_old_ticket() {
        let f = fixture(1000, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        f.handler.on_connect(user, "world", &everyone);
        f.handler.on_disconnect(&user);
        f.clock.advance(10);
        f.handler.on_connect(user, "world", &everyone);

        f.scheduler.run_all();
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_world_policy() {
        let worlds = WorldPolicy {
            enabled: Vec::new(),
            disabled: vec!["minigames".into()],
        };
        let f = fixture(0, false, worlds);
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        let no_bypass = |perm: &str| perm != "joinsignal.bypass.world";
        assert_eq!(
            f.handler.on_connect(user, "minigames", &no_bypass),
            ConnectOutcome::Skipped
        );
        assert!(matches!(
            f.handler.on_connect(user, "minigames", &everyone),
            ConnectOutcome::Played(_)
        ));
    }

    #[test]
    fn test_playback_failure_reported() {
        let f = fixture(0, true, WorldPolicy::default());
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        assert!(matches!(
            f.handler.on_connect(user, "world", &everyone),
            ConnectOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_preview_plays_to_user_only() {
        let f = fixture(1000, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        match f.handler.preview(user, "bell", &everyone) {
            PreviewOutcome::Played(req) => {
                assert_eq!(req.user, user);
                assert_eq!(req.signal_id, "bell");
                assert_eq!(req.audience, Audience::SelfOnly);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // no delay and nothing stored
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);
        assert_eq!(f.handler.pending(), 0);
        assert_eq!(f.store.current_selection(&user), None);
    }

    #[test]
    fn test_preview_refusals() {
        let f = fixture(0, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        assert_eq!(
            f.handler.preview(user, "gong", &everyone),
            PreviewOutcome::Refused(Rejection::UnknownSignal("gong".into()))
        );
        let no_bell = |perm: &str| perm != "js.sound.bell";
        assert_eq!(
            f.handler.preview(user, "bell", &no_bell),
            PreviewOutcome::Refused(Rejection::PermissionDenied("js.sound.bell".into()))
        );
        let nobody = |_: &str| false;
        assert_eq!(
            f.handler.preview(user, "bell", &nobody),
            PreviewOutcome::Refused(Rejection::PermissionDenied("joinsignal.use".into()))
        );
        assert!(f.playback.played.lock().unwrap().is_empty());
    }

    #[test]
    fn test_preview_playback_failure() {
        let f = fixture(0, true, WorldPolicy::default());
        assert!(matches!(
            f.handler.preview(Uuid::new_v4(), "bell", &everyone),
            PreviewOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_select_previews_new_choice() {
        let mut f = fixture(1000, false, WorldPolicy::default());
        let user = Uuid::new_v4();
        let accepted = f.handler.select(user, "bell", &everyone).unwrap();
        assert_eq!(accepted.signal.id, "bell");
        {
            let played = f.playback.played.lock().unwrap();
            assert_eq!(played.len(), 1);
            assert_eq!(played[0].audience, Audience::SelfOnly);
        }

        // refused selections play nothing
        f.clock.advance(60);
        assert!(f.handler.select(user, "gong", &everyone).is_err());
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);

        f.handler.preview_on_select = false;
        f.clock.advance(60);
        f.handler.select(user, "bell", &everyone).unwrap();
        assert_eq!(f.playback.played.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_short_circuits() {
        let mut f = fixture(0, false, WorldPolicy::default());
        f.handler.general.enabled = false;
        let user = Uuid::new_v4();
        f.store.try_select(user, "bell", &everyone).unwrap();
        assert_eq!(f.handler.on_connect(user, "world", &everyone), ConnectOutcome::Disabled);
    }
}
