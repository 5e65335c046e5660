use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth;
use crate::budget::credit::CreditPersistence;
use crate::budget::tracker::EventAccumulator;
use crate::budget::engine::Extension;
use crate::budget::{Clock, Credit, FileCreditStore, SystemClock};
use crate::config::{self, AppConfig, CONFIG_TEMPLATE};
use crate::daemon::{self, DataPaths};
use crate::platform::SessionEventLog;
use crate::platform::common::{atomic_write, ensure_directory_exists};
use crate::remote::DeviceIdentity;

use super::utils::{
    format_duration, format_minutes, init_logging, read_password, resolve_config_path,
    resolve_data_dir,
};

/// Run the daemon in the foreground
pub fn start(config: Option<PathBuf>, data_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config_path = resolve_config_path(config)?;
    let app_config = AppConfig::load(&config_path).context("Invalid configuration")?;
    init_logging(verbose, &app_config.logging)?;

    let data_dir = resolve_data_dir(data_dir)?;

    println!("Starting screen-budget in foreground mode...");
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon::run_daemon(app_config, data_dir))
}

/// Today's usage as recorded by the daemon
struct TodaySummary {
    day_key: String,
    credit: Credit,
    stored: bool,
    used_minutes: i64,
}

fn summarize_today(paths: &DataPaths, config: &AppConfig, clock: &dyn Clock) -> Result<TodaySummary> {
    let now = clock.now_millis();
    let day_key = clock.day_key(now);

    let stored = FileCreditStore::new(&paths.credits)
        .load(&day_key)
        .context("Failed to read credits")?;

    let events = SessionEventLog::open(&paths.events)?;
    let mut accumulator = EventAccumulator::new(Arc::new(events));
    let used_ms = accumulator.update(clock.day_start_millis(now), now);

    Ok(TodaySummary {
        day_key,
        credit: stored.unwrap_or_else(|| config.budget.default_credit()),
        stored: stored.is_some(),
        used_minutes: used_ms / 60_000,
    })
}

/// Show today's budget and remote-control settings
pub fn status(config: Option<PathBuf>, data_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config_path = resolve_config_path(config)?;
    let app_config = AppConfig::load(&config_path)?;
    init_logging(verbose, &app_config.logging)?;

    let data_dir = resolve_data_dir(data_dir)?;
    let paths = DataPaths::new(&data_dir);
    let today = summarize_today(&paths, &app_config, &SystemClock)?;

    println!("Screen Budget Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Config:        {}", config_path.display());
    println!("Data dir:      {}", data_dir.display());
    println!();
    println!("Day:           {}", today.day_key);
    println!(
        "Budget:        {}{}",
        format_minutes(today.credit.minutes),
        if today.stored { "" } else { " (default)" }
    );
    println!("Used:          {}", format_minutes(today.used_minutes));
    println!(
        "Remaining:     {}",
        format_minutes(today.credit.remaining(today.used_minutes))
    );
    println!(
        "Extensions:    {} x 5 min, {} x 1 min",
        today.credit.five_extends, today.credit.one_extends
    );
    if today.credit.remaining(today.used_minutes) <= 0 {
        println!("State:         BLOCKED");
    }

    println!();
    println!(
        "Discovery:     {} (UDP {}:{})",
        if app_config.discovery.enabled { "enabled" } else { "disabled" },
        app_config.discovery.bind_address,
        app_config.discovery.port
    );

    println!("Device id:     {}", describe_identity(&paths.identity));
    println!(
        "Admin grant:   {}",
        if app_config.budget.admin_password_hash.is_some() { "enabled" } else { "no password set" }
    );

    Ok(())
}

/// Spend one extension unit from today's pools
///
/// The running daemon notices the rewritten credit file on its next check.
pub fn extend(
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    minutes: u32,
    verbose: bool,
) -> Result<()> {
    let config_path = resolve_config_path(config)?;
    let app_config = AppConfig::load(&config_path)?;
    init_logging(verbose, &app_config.logging)?;

    let data_dir = resolve_data_dir(data_dir)?;
    let paths = DataPaths::new(&data_dir);
    let extension = apply_extension(
        &app_config,
        &paths,
        Arc::new(SystemClock),
        ExtensionRequest::Pool(minutes),
    )?;

    println!(
        "✓ Granted {} minute{}, today's budget is now {}",
        extension.granted_minutes,
        if extension.granted_minutes == 1 { "" } else { "s" },
        format_minutes(extension.credit.minutes)
    );
    println!(
        "  Extensions left: {} x 5 min, {} x 1 min",
        extension.credit.five_extends, extension.credit.one_extends
    );

    Ok(())
}

/// Add minutes to today's budget after checking the admin password
pub fn grant(
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    minutes: u32,
    password: Option<String>,
    verbose: bool,
) -> Result<()> {
    let config_path = resolve_config_path(config)?;
    let app_config = AppConfig::load(&config_path)?;
    init_logging(verbose, &app_config.logging)?;

    let password = read_password(password, "Admin password")?;
    let data_dir = resolve_data_dir(data_dir)?;
    let paths = DataPaths::new(&data_dir);

    let clock = Arc::new(SystemClock);
    let extension = grant_with_password(&app_config, &paths, clock, minutes, &password)?;

    println!(
        "✓ Added {} minutes, today's budget is now {}",
        extension.granted_minutes,
        format_minutes(extension.credit.minutes)
    );

    Ok(())
}

fn grant_with_password(
    config: &AppConfig,
    paths: &DataPaths,
    clock: Arc<dyn Clock>,
    minutes: u32,
    password: &str,
) -> Result<Extension> {
    let Some(hash) = config.budget.admin_password_hash.as_deref() else {
        anyhow::bail!("No admin password is set. Run `screen-budget config set-password` first");
    };

    if !auth::verify_password(password, hash)? {
        warn!("Rejected admin grant of {} minutes: wrong password", minutes);
        anyhow::bail!("Invalid admin password");
    }

    apply_extension(config, paths, clock, ExtensionRequest::Direct(minutes))
}

/// Hash a new admin password into the config file
pub fn set_password(config: Option<PathBuf>, password: Option<String>) -> Result<()> {
    let config_path = resolve_config_path(config)?;
    let password = read_password(password, "New admin password")?;
    store_password_hash(&config_path, &password)?;

    println!("✓ Admin password updated in {}", config_path.display());
    Ok(())
}

fn store_password_hash(config_path: &Path, password: &str) -> Result<()> {
    let mut app_config = AppConfig::load(config_path)?;
    app_config.budget.admin_password_hash = Some(auth::hash_password(password)?);
    app_config.save(config_path)
}

enum ExtensionRequest {
    /// Spend a pool unit
    Pool(u32),
    /// Privileged: usage plus exactly this many minutes
    Direct(u32),
}

fn apply_extension(
    config: &AppConfig,
    paths: &DataPaths,
    clock: Arc<dyn Clock>,
    request: ExtensionRequest,
) -> Result<Extension> {
    let day_key = clock.day_key(clock.now_millis());
    let events = Arc::new(SessionEventLog::open(&paths.events)?);

    let runtime = tokio::runtime::Runtime::new()?;
    let extension = runtime
        .block_on(async {
            // Only the daemon watches the screen; assume someone is at it
            let (_screen_tx, screen) = watch::channel(true);
            let engine = daemon::build_engine(config, paths, events, clock, screen);

            match request {
                ExtensionRequest::Pool(minutes) => engine.credit_extension(minutes).await,
                ExtensionRequest::Direct(minutes) => engine.direct_extension(minutes).await,
            }
        })
        .context("Extension refused")?;

    let saved = FileCreditStore::new(&paths.credits)
        .load(&day_key)
        .context("Failed to read credits")?;
    if saved != Some(extension.credit) {
        anyhow::bail!(
            "Extension could not be saved to {} (is it writable?)",
            paths.credits.display()
        );
    }

    Ok(extension)
}

/// Print the device identifier a parent needs, creating it if needed
pub fn device_id(data_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    init_logging(verbose, &config::LoggingConfig::default())?;

    let data_dir = resolve_data_dir(data_dir)?;
    ensure_directory_exists(&data_dir)?;

    let identity = DeviceIdentity::load_or_create(&DataPaths::new(&data_dir).identity)?;
    println!("{}", identity.device_id());

    Ok(())
}

/// Write a commented default configuration file
pub fn config_init(output: Option<PathBuf>, force: bool) -> Result<()> {
    let output_path = resolve_config_path(output)?;
    write_template(&output_path, force)?;

    println!("✓ Created configuration file: {}", output_path.display());
    println!("\nTo let a parent device control this one, set:");
    println!("\n[discovery]");
    println!("enabled = true");
    println!("\nThen start the daemon: screen-budget start");

    Ok(())
}

/// One-line identity summary; a read failure must not abort `status`
fn describe_identity(path: &Path) -> String {
    // The identity file is owner-only, so other users cannot read it
    match DeviceIdentity::load(path) {
        Ok(Some(identity)) => {
            let age = chrono::Utc::now() - identity.created_at();
            format!("{} (created {} ago)", identity.device_id(), format_duration(age))
        }
        Ok(None) => "not yet generated".to_string(),
        Err(e) => {
            debug!("Could not read device identity: {:#}", e);
            "unavailable (run as the daemon's user to see it)".to_string()
        }
    }
}

fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory_exists(parent)?;
    }

    atomic_write(path, CONFIG_TEMPLATE.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}
