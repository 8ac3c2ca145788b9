use anyhow::Result;
use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_controller::config::{self, Config};
use irrigation_controller::programs::{ProgramStore, StepRules};
use irrigation_controller::run_state::RunStateStore;
use irrigation_controller::scheduler::{self, Scheduler, SchedulerSettings};
use irrigation_controller::web;
use irrigation_controller::zones::{ZoneController, ZoneLimits};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let cfg = config::load(&config_path)?;
    info!(path = %config_path, zones = cfg.zones.len(), "config loaded");

    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(cfg.controller.relay_active_low);

    // ── Stores ──────────────────────────────────────────────────────
    let data_dir = cfg.storage.data_dir.clone();
    let run_state = Arc::new(RunStateStore::open(&data_dir));

    // ── Zone outputs ────────────────────────────────────────────────
    let limits = ZoneLimits {
        max_active_zones: cfg.controller.max_active_zones,
        max_zone_duration_min: cfg.controller.max_zone_duration_min,
    };
    let zones = build_zones(active_low, limits, Arc::clone(&run_state))?;
    if !zones.initialize(&cfg.zone_bindings(), cfg.relay_pin()) {
        error!("no zone output could be initialised; serving with every zone off");
    }

    let programs = ProgramStore::open(&data_dir, step_rules(&cfg));
    let scheduler = Scheduler::new(
        zones,
        run_state,
        programs,
        SchedulerSettings::from(&cfg.controller),
    );

    // Whatever was running before this boot is gone; start from a clean slate.
    scheduler.reset_state().await;
    info!(data_dir = %data_dir.display(), "controller started");

    // ── Web server ──────────────────────────────────────────────────
    let web_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_scheduler, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(scheduler.clone()));

    tokio::signal::ctrl_c().await?;
    warn!("shutdown requested, switching everything off");
    scheduler.reset_state().await;
    Ok(())
}

fn step_rules(cfg: &Config) -> StepRules {
    StepRules {
        zone_ids: cfg.zones.iter().map(|z| z.id).collect::<BTreeSet<u8>>(),
        max_duration_min: cfg.controller.max_zone_duration_min,
    }
}

#[cfg(feature = "gpio")]
fn build_zones(
    active_low: bool,
    limits: ZoneLimits,
    run_state: Arc<RunStateStore>,
) -> Result<ZoneController> {
    let board = irrigation_controller::output::GpioBoard::new(active_low)?;
    info!(active_low, "gpio board ready");
    Ok(ZoneController::new(board, limits, run_state))
}

#[cfg(not(feature = "gpio"))]
fn build_zones(
    active_low: bool,
    limits: ZoneLimits,
    run_state: Arc<RunStateStore>,
) -> Result<ZoneController> {
    warn!(active_low, "built without the gpio feature; driving a mock board");
    let board = irrigation_controller::output::MockBoard::new();
    Ok(ZoneController::new(board, limits, run_state))
}
