//! Escrow health monitor.
//!
//! Verifies that proposals will not be held in escrow and tracks how often
//! that verification itself fails. Repeated failures usually mean a stale
//! session that only a process restart fixes, so after the failure threshold
//! the monitor asks the supervisor for a restart, unless the probe says the
//! outside world is down or the remote service is in its weekly maintenance
//! window.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::TradeError;
use crate::services::{Alert, AlertKind, Alerter, ProcessSupervisor, ReachabilityProbe, TradeService};
use crate::types::{PartnerId, Proposal};

/// Source of "now". Swapped out in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Weekly window during which restarts are deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub weekday: Weekday,
    pub start_hour: u32,
    pub start_minute: u32,
    pub duration_minutes: u32,
}

impl Default for MaintenanceWindow {
    /// Tuesdays 23:00–23:29 UTC.
    fn default() -> Self {
        Self {
            weekday: Weekday::Tue,
            start_hour: 23,
            start_minute: 0,
            duration_minutes: 30,
        }
    }
}

impl MaintenanceWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if at.weekday() != self.weekday {
            return false;
        }
        let minute_of_day = at.hour() * 60 + at.minute();
        let start = self.start_hour * 60 + self.start_minute;
        minute_of_day >= start && minute_of_day < start + self.duration_minutes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscrowSettings {
    /// Consecutive failures that warrant a restart.
    pub failure_threshold: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Session re-establishments allowed within one check.
    pub max_session_resets: u32,
    /// Delay between a failed check and the restart decision.
    pub restart_trigger_delay: Duration,
    /// Wait before reconsidering a deferred restart.
    pub restart_cooldown: Duration,
    pub maintenance: MaintenanceWindow,
}

impl Default for EscrowSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            max_session_resets: 3,
            restart_trigger_delay: Duration::from_secs(2),
            restart_cooldown: Duration::from_secs(3 * 60),
            maintenance: MaintenanceWindow::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorPhase {
    Idle,
    Checking,
    Healthy,
    Failed,
}

/// Outcome of a restart decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartDecision {
    BelowThreshold,
    /// Probe failed; reconsidered after the cooldown.
    DeferredProbeDown,
    /// Inside the maintenance window; reconsidered after the cooldown.
    DeferredMaintenance,
    Restarting,
    /// No process manager to restart us; operator notified.
    Unsupervised,
    RestartFailed,
}

/// Read-only view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub phase: MonitorPhase,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub restart_pending: bool,
}

struct HealthState {
    phase: MonitorPhase,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    restart_timer: Option<JoinHandle<()>>,
}

impl HealthState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitorInner {
    service: Arc<dyn TradeService>,
    probe: Arc<dyn ReachabilityProbe>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    alerts: Arc<dyn Alerter>,
    settings: EscrowSettings,
    clock: Clock,
    state: Mutex<HealthState>,
}

#[derive(Clone)]
pub struct EscrowMonitor {
    inner: Arc<MonitorInner>,
}

impl EscrowMonitor {
    pub fn new(
        service: Arc<dyn TradeService>,
        probe: Arc<dyn ReachabilityProbe>,
        supervisor: Option<Arc<dyn ProcessSupervisor>>,
        alerts: Arc<dyn Alerter>,
        settings: EscrowSettings,
    ) -> Self {
        Self::with_clock(service, probe, supervisor, alerts, settings, system_clock())
    }

    pub fn with_clock(
        service: Arc<dyn TradeService>,
        probe: Arc<dyn ReachabilityProbe>,
        supervisor: Option<Arc<dyn ProcessSupervisor>>,
        alerts: Arc<dyn Alerter>,
        settings: EscrowSettings,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                service,
                probe,
                supervisor,
                alerts,
                settings,
                clock,
                state: Mutex::new(HealthState {
                    phase: MonitorPhase::Idle,
                    consecutive_failures: 0,
                    last_check: None,
                    restart_timer: None,
                }),
            }),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.inner.state.lock();
        HealthSnapshot {
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            last_check: state.last_check,
            restart_pending: state
                .restart_timer
                .as_ref()
                .is_some_and(|t| !t.is_finished()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state.lock().consecutive_failures
    }

    fn check_backoff(&self, attempt: u32) -> Duration {
        let base = self.inner.settings.backoff_base.as_millis() as f64;
        let factor = rand::thread_rng().gen_range(1.0..2.0);
        let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((base * exp * factor) as u64)
    }

    /// Whether the counterparty of `proposal` would have it held in escrow.
    pub async fn check_escrow(&self, proposal: &Proposal) -> Result<bool, TradeError> {
        {
            let mut state = self.inner.state.lock();
            state.cancel_timer();
            state.phase = MonitorPhase::Checking;
            state.last_check = Some((self.inner.clock)());
        }
        debug!(offer_id = %proposal.id, "Checking escrow");

        let settings = &self.inner.settings;
        let mut attempt = 0;
        let mut session_resets = 0;
        loop {
            attempt += 1;
            let err = match self.inner.service.escrow_details(&proposal.id).await {
                Ok(details) => {
                    let mut state = self.inner.state.lock();
                    state.consecutive_failures = 0;
                    state.phase = MonitorPhase::Healthy;
                    debug!(offer_id = %proposal.id, escrow_days = details.their_escrow_days, "Done checking escrow");
                    return Ok(details.their_escrow_days != 0);
                }
                Err(e) => e,
            };

            if err.is_session_loss() && session_resets < settings.max_session_resets {
                // Session problems are not counted against the service.
                session_resets += 1;
                attempt = 0;
                if let Err(e) = self.inner.service.refresh_session().await {
                    debug!(error = %e, "Session refresh failed during escrow check");
                }
                continue;
            }

            if attempt < settings.max_attempts {
                let delay = self.check_backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying escrow check");
                tokio::time::sleep(delay).await;
                continue;
            }

            let failures = {
                let mut state = self.inner.state.lock();
                state.consecutive_failures += 1;
                state.phase = MonitorPhase::Failed;
                state.consecutive_failures
            };
            error!(offer_id = %proposal.id, failures, error = %err, "Escrow check failed");
            self.arm_trigger(proposal.partner.clone(), settings.restart_trigger_delay);
            return Err(err.into());
        }
    }

    /// Schedule a restart decision, replacing any pending one.
    fn arm_trigger(&self, partner: PartnerId, delay: Duration) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            monitor.trigger_restart(&partner).await;
        });

        let mut state = self.inner.state.lock();
        state.cancel_timer();
        state.restart_timer = Some(handle);
    }

    /// Decide whether to restart now.
    pub async fn trigger_restart(&self, partner: &PartnerId) -> RestartDecision {
        let failures = self.consecutive_failures();
        debug!(failures, "Escrow check problem occurred");

        if failures < self.inner.settings.failure_threshold {
            return RestartDecision::BelowThreshold;
        }

        let alerts = &self.inner.alerts;
        let cooldown = self.inner.settings.restart_cooldown;

        if let Err(e) = self.inner.probe.probe(partner).await {
            warn!(error = %e, "Not restarting: reachability probe failed");
            alerts
                .alert(
                    Alert::new(
                        AlertKind::EscrowProbeDown,
                        format!(
                            "Unable to perform automatic restart after {failures} failed escrow checks: probe is down"
                        ),
                    )
                    .with_error(e)
                    .with_failed_count(failures),
                )
                .await;
            // Re-arming aborts the running timer, so nothing may await after it.
            self.arm_trigger(partner.clone(), cooldown);
            return RestartDecision::DeferredProbeDown;
        }

        if self.inner.settings.maintenance.contains((self.inner.clock)()) {
            warn!("Not restarting: remote service is in its maintenance window");
            alerts
                .alert(
                    Alert::new(
                        AlertKind::EscrowMaintenance,
                        format!(
                            "Unable to perform automatic restart after {failures} failed escrow checks: maintenance window"
                        ),
                    )
                    .with_failed_count(failures),
                )
                .await;
            self.arm_trigger(partner.clone(), cooldown);
            return RestartDecision::DeferredMaintenance;
        }

        alerts
            .alert(
                Alert::new(
                    AlertKind::EscrowRestart,
                    format!("Escrow check failed {failures} times in a row, restarting"),
                )
                .with_failed_count(failures),
            )
            .await;

        let Some(supervisor) = self.inner.supervisor.as_ref() else {
            self.notify_unsupervised().await;
            return RestartDecision::Unsupervised;
        };

        match supervisor.restart().await {
            Ok(true) => {
                info!(failures, "Restart requested");
                RestartDecision::Restarting
            }
            Ok(false) => {
                self.notify_unsupervised().await;
                RestartDecision::Unsupervised
            }
            Err(e) => {
                warn!(error = %e, "Error occurred while trying to restart");
                alerts
                    .alert(
                        Alert::new(AlertKind::FailedRestartError, "An error occurred while trying to restart")
                            .with_error(e),
                    )
                    .await;
                RestartDecision::RestartFailed
            }
        }
    }

    async fn notify_unsupervised(&self) {
        warn!("Automatic restart failed: not running under a process manager");
        self.inner
            .alerts
            .alert(Alert::new(
                AlertKind::FailedSupervisor,
                "Automatic restart on escrow check problem failed: not running under a process manager",
            ))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
