//! offer-reconciler: keeps trade proposals and their items in sync.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores poll data from disk (or starts fresh), wires the engine to its
//! collaborators and runs the poll loop until Ctrl+C or a restart request.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use offer_reconciler::balance::Balancer;
use offer_reconciler::config::AppConfig;
use offer_reconciler::engine::{Collaborators, Engine, EscrowMonitor, Poller};
use offer_reconciler::services::alerts::{LogAlerter, WebhookAlerter};
use offer_reconciler::services::bridge::BridgeClient;
use offer_reconciler::services::paper::{PaperInventory, PaperTradeService, ScriptedHandler, StaticPrices};
use offer_reconciler::services::probe::BackpackProbe;
use offer_reconciler::services::supervisor::EnvSupervisor;
use offer_reconciler::services::{Alerter, ProcessSupervisor};
use offer_reconciler::status;
use offer_reconciler::storage;
use offer_reconciler::types::PriceSnapshot;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    info!(
        agent_name = %cfg.agent.name,
        poll_interval_secs = cfg.agent.poll_interval_secs,
        dry_run = cfg.agent.dry_run,
        bridge = cfg.bridge.enabled,
        "offer-reconciler starting up"
    );

    let state_file = cfg.storage.state_file.clone();
    let poll_data = storage::load_poll_data(Some(&state_file))?.unwrap_or_default();

    // -- Collaborators -----------------------------------------------------

    let alerts: Arc<dyn Alerter> =
        match AppConfig::resolve_optional(cfg.alerts.webhook_url_env.as_deref()) {
            Some(url) => Arc::new(WebhookAlerter::new(url)?),
            None => Arc::new(LogAlerter),
        };

    let collaborators = if cfg.bridge.enabled {
        let api_key = AppConfig::resolve_optional(cfg.bridge.api_key_env.as_deref());
        let bridge = Arc::new(BridgeClient::new(
            &cfg.bridge.url,
            api_key,
            Duration::from_secs(cfg.bridge.timeout_secs),
        )?);
        info!(url = %cfg.bridge.url, "Using trading bridge");
        Collaborators {
            service: bridge.clone(),
            handler: bridge.clone(),
            inventory: bridge.clone(),
            prices: bridge,
            alerts: alerts.clone(),
        }
    } else {
        warn!("Bridge disabled: running against the in-memory paper service");
        Collaborators {
            service: Arc::new(PaperTradeService::new()),
            handler: Arc::new(ScriptedHandler::new()),
            inventory: Arc::new(PaperInventory::new(&[])),
            prices: Arc::new(StaticPrices::new(PriceSnapshot::new())),
            alerts: alerts.clone(),
        }
    };
    let service = collaborators.service.clone();

    // -- Escrow monitor ----------------------------------------------------

    let restart_signal = Arc::new(Notify::new());
    let supervisor = EnvSupervisor::from_env(restart_signal.clone());
    let supervisor: Option<Arc<dyn ProcessSupervisor>> = if supervisor.is_supervised() {
        Some(Arc::new(supervisor))
    } else {
        None
    };

    let escrow = if cfg.escrow.check_on_intake {
        let probe = BackpackProbe::new(
            &cfg.probe.url,
            AppConfig::resolve_optional(cfg.probe.api_key_env.as_deref()),
            cfg.agent.user_id.clone(),
        )?;
        Some(EscrowMonitor::new(
            service.clone(),
            Arc::new(probe),
            supervisor,
            alerts,
            cfg.escrow_settings()?,
        ))
    } else {
        None
    };

    // -- Engine ------------------------------------------------------------

    let balancer = Balancer::new(cfg.currency_ladder()?, cfg.balancer_options());
    let engine = Engine::new(collaborators, balancer, cfg.engine_settings(), escrow);
    engine.set_poll_data(poll_data);
    let _dispatcher = engine.spawn_dispatcher();

    if cfg.status.enabled {
        status::spawn_status_server(engine.clone(), cfg.status.port)?;
    }

    let poller = Poller::new(engine.clone(), service);

    // -- Main loop ---------------------------------------------------------

    let mut interval = tokio::time::interval(engine.settings().poll_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.poll_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    let mut restart = false;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match poller.poll_once().await {
                    Ok(summary) => info!(
                        new = summary.new_offers,
                        changed = summary.changed,
                        sent_active = summary.sent_active,
                        received_active = summary.received_active,
                        "Poll complete"
                    ),
                    Err(e) => error!(error = %e, "Poll failed"),
                }
                save(&engine, &state_file);
            }
            _ = restart_signal.notified() => {
                warn!("Restart requested, exiting for the process manager");
                restart = true;
                break;
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    save(&engine, &state_file);
    info!(status = ?engine.status(), "offer-reconciler stopped");

    if restart {
        std::process::exit(1);
    }
    Ok(())
}

fn save(engine: &Engine, path: &str) {
    if let Err(e) = storage::save_poll_data(&engine.poll_data(), Some(path)) {
        error!(error = %e, "Failed to save poll data");
    }
}

/// Initialise the tracing subscriber.
///
/// Uses JSON format if `RECONCILER_LOG_JSON` is set, otherwise pretty
/// console output. Log level is controlled by `RUST_LOG`.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("offer_reconciler=info"));

    let json_logging = std::env::var("RECONCILER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
