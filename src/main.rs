//! stage_fleet - run the motion-stage fleet headless.
//!
//! Loads settings, builds the PI, Standa and virtual families on simulated drivers,
//! optionally restores a saved configuration set and prints every fleet event to
//! stdout as one JSON object per line until interrupted.

use anyhow::Context;
use clap::Parser;
use stage_fleet::config::Settings;
use stage_fleet::convergence::{ConfigurationProbe, ConvergenceScheduler};
use stage_fleet::events::EventKind;
use stage_fleet::families::{PiFamily, StandaFamily, VirtualFamily};
use stage_fleet::settings::{
    ConfigurationSets, JsonSettingsVault, SettingsStore, StageCatalog, PI_STAGES_STORE,
    STANDA_STAGES_STORE,
};
use stage_fleet::{Fleet, SessionInterface};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stage_fleet")]
#[command(about = "Supervise a fleet of motion-stage controllers")]
#[command(version)]
struct Cli {
    /// Settings file (TOML); missing files fall back to defaults
    #[arg(short, long, default_value = "config/stage_fleet.toml")]
    config: PathBuf,

    /// Saved configuration set to apply at startup
    #[arg(short, long)]
    restore: Option<String>,

    /// Save the configurations under this set name on shutdown
    #[arg(long)]
    save_as: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let vault = Arc::new(JsonSettingsVault::new(&settings.storage.settings_dir));
    let fleet = Arc::new(build_fleet(&settings, vault).await?);

    let (_subscription, mut events) = fleet
        .events()
        .channel(&EventKind::ALL)
        .context("subscribing to fleet events")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("event not serializable: {e}"),
            }
        }
    });

    let mut convergence = None;
    if let Some(name) = &cli.restore {
        match fleet.load_set(name).await.context("restoring saved set")? {
            Some(responses) => {
                let keys: Vec<i64> = responses
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.identifier)
                    .collect();
                info!(set = %name, applied = keys.len(), total = responses.len(), "set restored");
                let scheduler = ConvergenceScheduler::from_config(&settings.convergence);
                convergence = Some(scheduler.arm(ConfigurationProbe(Arc::clone(&fleet)), keys));
            }
            None => warn!(set = %name, "no saved configuration set of that name"),
        }
    }

    info!(
        name = %settings.application.name,
        families = ?fleet.interface_names(),
        "running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    if let Some(name) = &cli.save_as {
        let saved = fleet
            .save_current_set(name)
            .await
            .with_context(|| format!("saving configuration set {name}"))?;
        info!(set = %name, saved, "configurations saved");
    }
    if let Some(convergence) = convergence {
        convergence.abort();
    }
    fleet.shutdown().await;
    printer.abort();
    Ok(())
}

async fn build_fleet(settings: &Settings, vault: Arc<JsonSettingsVault>) -> anyhow::Result<Fleet> {
    let pi_catalog = StageCatalog::load(vault.as_ref(), PI_STAGES_STORE)
        .await
        .context("loading the PI stage catalog")?;
    let standa_catalog = StageCatalog::load(vault.as_ref(), STANDA_STAGES_STORE)
        .await
        .context("loading the Standa stage catalog")?;

    let store: Arc<dyn SettingsStore> = vault;
    let fleet = Fleet::with_sets(ConfigurationSets::new(store));
    fleet.add_interface(Arc::new(SessionInterface::new(PiFamily::with_simulation(
        Arc::new(pi_catalog),
        settings,
    ))))?;
    fleet.add_interface(Arc::new(SessionInterface::new(StandaFamily::with_simulation(
        Arc::new(standa_catalog),
        settings,
    ))))?;
    fleet.add_interface(Arc::new(SessionInterface::new(VirtualFamily::from_settings(
        settings,
    ))))?;
    Ok(fleet)
}
