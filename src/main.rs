use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use joinsignal::app::JoinSignals;
use joinsignal::catalog::source::CatalogSource;
use joinsignal::catalog::SignalDefinition;
use joinsignal::clock::SystemClock;
use joinsignal::config::AppConfig;
use joinsignal::storage::sql::DriverRegistry;
use joinsignal::trigger::{
    Audience, ConnectOutcome, Playback, PlaybackError, PlaybackRequest, PreviewOutcome,
    ThreadScheduler,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "joinsignal", version, about = "Per-player join sound catalog and preference store")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding player data (defaults to the XDG data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sound definition document (defaults to sounds.yml in the data dir)
    #[arg(long, global = true)]
    sounds: Option<PathBuf>,

    /// Permission held by the acting player (repeatable)
    #[arg(long = "grant", global = true)]
    grants: Vec<String>,

    /// Act as a player holding every permission
    #[arg(long, global = true)]
    all_permissions: bool,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the sounds the acting player can select
    List {
        /// Include disabled, hidden and out-of-season sounds
        #[arg(long)]
        all: bool,
    },

    /// Show which sound an id or alias resolves to
    Resolve {
        identifier: String,
    },

    /// Show a player's stored selection
    Show {
        user: Uuid,
    },

    /// Select a sound for a player
    Set {
        user: Uuid,
        /// Sound id or alias
        sound: String,
    },

    /// Play a sound to a player alone, without selecting it
    Preview {
        user: Uuid,
        /// Sound id or alias
        sound: String,
    },

    /// Remove a player's selection
    #[command(alias = "remove", alias = "off")]
    Clear {
        user: Uuid,
    },

    /// Run the connect-time checks for a player and print what would play
    Trigger {
        user: Uuid,

        /// World the player connects into
        #[arg(long, default_value = "world")]
        world: String,
    },

    /// Show storage and catalog status
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Prints playback requests instead of emitting audio.
struct PrintPlayback;

impl Playback for PrintPlayback {
    fn play(&self, request: &PlaybackRequest) -> Result<(), PlaybackError> {
        let reach = match request.audience {
            Audience::SelfOnly => "to the player only".to_string(),
            Audience::Nearby if request.play_to_self => format!("radius {}", request.radius),
            Audience::Nearby => format!("radius {}, not to self", request.radius),
        };
        println!(
            "Playing {} ({}) for {}: volume {:.2}, pitch {:.2}, {}",
            request.signal_id,
            request.audio_ref,
            request.user,
            request.volume,
            request.pitch,
            reach
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct InfoReport {
    storage: joinsignal::coordinator::StorageInfo,
    sounds_loaded: usize,
    sounds_enabled: usize,
    sounds_available: usize,
    aliases: usize,
    catalog_generation: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // general.debug picks the default filter, so config is read before logging
    // is set up and validated after, once clamp warnings can be seen
    let (config, config_error) = match &cli.config {
        Some(path) => (
            AppConfig::read(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None,
        ),
        None => match AppConfig::read_default() {
            Ok(config) => (config, None),
            Err(e) => (AppConfig::default(), Some(e)),
        },
    };

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 if config.general.debug => "debug",
        0 => "warn",
        1 if config.general.debug => "debug",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if let Some(e) = config_error {
        log::warn!("{e}. Using defaults.");
    }
    let mut config = config.validated();
    // one-shot process: nothing would be around to run a delayed playback
    config.sounds.play_delay_ms = 0;

    // Resolve paths: CLI > XDG default
    let data_dir = cli.data_dir.clone().unwrap_or_else(AppConfig::data_dir);
    log::info!("Data directory: {}", data_dir.display());
    let source = match &cli.sounds {
        Some(path) => CatalogSource::from_path(path)
            .with_context(|| format!("Failed to load sounds from {}", path.display()))?,
        None => {
            let path = data_dir.join(joinsignal::DEFAULT_SOUNDS_FILE);
            if path.exists() {
                CatalogSource::from_path(&path)
                    .with_context(|| format!("Failed to load sounds from {}", path.display()))?
            } else {
                log::warn!("No sound document at {}, catalog is empty", path.display());
                CatalogSource::default()
            }
        }
    };

    let app = JoinSignals::start(
        config,
        &data_dir,
        source,
        &DriverRegistry::builtin(),
        Arc::new(SystemClock),
        Arc::new(PrintPlayback),
        Arc::new(ThreadScheduler),
    )
    .context("Failed to open player data storage")?;

    let grants = cli.grants;
    let all_permissions = cli.all_permissions;
    let has_permission = move |perm: &str| all_permissions || grants.iter().any(|g| g == perm);

    match cli.command {
        Commands::List { all } => {
            let sounds = if all {
                app.catalog().all()
            } else {
                app.catalog().accessible_to(&has_permission)
            };
            if sounds.is_empty() {
                println!("No sounds available.");
                return Ok(());
            }
            println!(
                "{:<20} {:<24} {:<28} {:>4} {:>4} {:>6}",
                "Id", "Name", "Permission", "Vol", "Pit", "Radius"
            );
            println!("{}", "-".repeat(91));
            for def in sounds.values() {
                println!(
                    "{:<20} {:<24} {:<28} {:>4.2} {:>4.2} {:>6}{}",
                    truncate(&def.id, 20),
                    truncate(&def.display_name, 24),
                    truncate(&def.permission, 28),
                    def.volume,
                    def.pitch,
                    def.radius,
                    status_suffix(&app, def)
                );
            }
            let aliases = app.catalog().aliases();
            if !aliases.is_empty() {
                println!();
                println!("Aliases:");
                for entry in aliases {
                    println!("  {:<20} -> {}", entry.alias, entry.target);
                }
            }
        }

        Commands::Resolve { identifier } => match app.catalog().resolve(&identifier) {
            Some(def) => {
                println!("{} -> {} ({})", identifier, def.id, def.display_name);
                println!("  audio:      {}", def.audio_ref);
                println!("  permission: {}", def.permission);
                println!(
                    "  volume {:.2}, pitch {:.2}, radius {}",
                    def.volume, def.pitch, def.radius
                );
                if let Some(window) = &def.seasonal {
                    println!("  season:     {} to {}", window.start, window.end);
                }
                for line in &def.description {
                    println!("  {}", line);
                }
                println!(
                    "  selectable: {}",
                    if app.catalog().is_available_for_selection(&def) { "yes" } else { "no" }
                );
            }
            None => println!("No sound matching \"{}\".", identifier),
        },

        Commands::Show { user } => match app.coordinator().record(&user) {
            Some(record) => {
                println!("Player:       {}", record.user);
                println!(
                    "Sound:        {}",
                    record.signal.as_deref().unwrap_or("(none)")
                );
                println!("Last change:  {}", format_time(record.last_change));
                println!("Last played:  {}", format_time(record.last_triggered));
                let remaining = app
                    .store()
                    .cooldowns()
                    .remaining_seconds(&user, joinsignal::cooldown::CooldownKind::Change);
                if remaining > 0 {
                    println!("Can change in {}s", remaining);
                }
            }
            None => println!("No join sound set for {}.", user),
        },

        Commands::Set { user, sound } => {
            match app.connect().select(user, &sound, &has_permission) {
                Ok(accepted) => match accepted.previous {
                    Some(prev) if prev != accepted.signal.id => println!(
                        "Join sound for {} changed from {} to {}.",
                        user, prev, accepted.signal.display_name
                    ),
                    _ => println!(
                        "Join sound for {} set to {}.",
                        user, accepted.signal.display_name
                    ),
                },
                Err(rejection) => println!("{}.", rejection),
            }
            app.shutdown().context("Failed to save player data")?;
        }

        Commands::Preview { user, sound } => {
            match app.connect().preview(user, &sound, &has_permission) {
                PreviewOutcome::Played(_) => {}
                PreviewOutcome::Refused(rejection) => println!("{}.", rejection),
                PreviewOutcome::Failed(reason) => println!("Preview failed: {}", reason),
            }
        }

        Commands::Clear { user } => {
            if app.store().clear_selection(&user) {
                println!("Join sound removed for {}.", user);
            } else {
                println!("No join sound set for {}.", user);
            }
            app.shutdown().context("Failed to save player data")?;
        }

        Commands::Trigger { user, world } => {
            match app.connect().on_connect(user, &world, &has_permission) {
                ConnectOutcome::Disabled => println!("Join sounds are disabled."),
                ConnectOutcome::Skipped => {
                    println!("Nothing to play for {} (run with -vv for details).", user)
                }
                ConnectOutcome::Played(_) | ConnectOutcome::Scheduled { .. } => {}
                ConnectOutcome::Failed(reason) => println!("Playback failed: {}", reason),
            }
            app.shutdown().context("Failed to save player data")?;
        }

        Commands::Info { json } => {
            let catalog = app.catalog();
            let report = InfoReport {
                storage: app.coordinator().storage_info(),
                sounds_loaded: catalog.len(),
                sounds_enabled: catalog.enabled_count(),
                sounds_available: catalog.available().len(),
                aliases: catalog.aliases().len(),
                catalog_generation: catalog.generation(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("JoinSignal Status");
            println!("=================");
            println!("Storage:          {}", report.storage.kind);
            println!("Location:         {}", report.storage.location);
            if let Some(reason) = &report.storage.degraded {
                println!("DEGRADED MODE:    configured backend unavailable ({})", reason);
            }
            println!("Players:          {}", report.storage.records);
            println!(
                "Sounds:           {} loaded, {} enabled, {} available",
                report.sounds_loaded, report.sounds_enabled, report.sounds_available
            );
            println!("Aliases:          {}", report.aliases);
        }
    }

    Ok(())
}

fn status_suffix(app: &JoinSignals, def: &SignalDefinition) -> &'static str {
    if !def.enabled {
        "  [disabled]"
    } else if def.hidden {
        "  [hidden]"
    } else if !app.catalog().is_in_season(def) {
        "  [out of season]"
    } else {
        ""
    }
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Shorten long names for table columns.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
