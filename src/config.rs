//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys, webhook URLs) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`. Every section except
//! `[agent]` may be omitted, in which case the built-in defaults apply.

use anyhow::{Context, Result};
use chrono::Weekday;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::balance::{BalancerOptions, CurrencyLadder, Denomination};
use crate::engine::{EngineSettings, EscrowSettings, MaintenanceWindow, RetryPolicy};
use crate::types::Sku;

/// Env var overriding `[bridge] url`.
pub const ENV_BRIDGE_URL: &str = "RECONCILER_BRIDGE_URL";
/// Env var overriding `[agent] dry_run`.
pub const ENV_DRY_RUN: &str = "RECONCILER_DRY_RUN";
/// Env var overriding `[storage] state_file`.
pub const ENV_STATE_FILE: &str = "RECONCILER_STATE_FILE";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Log actions instead of performing them.
    #[serde(default)]
    pub dry_run: bool,
    /// Our own account id, used by the reachability probe.
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub send_timeout_backoff_base_ms: u64,
    pub action_retry_delay_secs: u64,
    pub retry_marker_ttl_secs: u64,
    pub inventory_retry_delay_secs: u64,
    pub poll_summary_interval_secs: u64,
    pub counter_message: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = EngineSettings::default();
        Self {
            max_attempts: defaults.retry.max_attempts,
            backoff_base_ms: defaults.retry.backoff_base.as_millis() as u64,
            send_timeout_backoff_base_ms: defaults.retry.send_timeout_backoff_base.as_millis() as u64,
            action_retry_delay_secs: defaults.action_retry_delay.as_secs(),
            retry_marker_ttl_secs: defaults.retry_marker_ttl.as_secs(),
            inventory_retry_delay_secs: defaults.inventory_retry_delay.as_secs(),
            poll_summary_interval_secs: defaults.poll_summary_interval.as_secs(),
            counter_message: defaults.counter_message,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BalancerConfig {
    pub weapons_as_currency: bool,
    pub fallback_kinds: Vec<String>,
    pub fallback_value: Decimal,
    pub show_only_metal: bool,
    /// Custom currency ladder. The standard key/metal ladder when absent.
    pub ladder: Option<LadderConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        let defaults = BalancerOptions::default();
        Self {
            weapons_as_currency: defaults.weapons_as_currency,
            fallback_kinds: Vec::new(),
            fallback_value: defaults.fallback_value,
            show_only_metal: defaults.show_only_metal,
            ladder: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LadderConfig {
    pub key: String,
    pub metals: Vec<Denomination>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EscrowConfig {
    /// Check every fetched proposal for escrow before deciding on it. On by
    /// default; turning it off also disables the restart monitor.
    pub check_on_intake: bool,
    pub failure_threshold: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_session_resets: u32,
    pub restart_trigger_delay_ms: u64,
    pub restart_cooldown_secs: u64,
    pub maintenance: MaintenanceConfig,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        let defaults = EscrowSettings::default();
        Self {
            check_on_intake: true,
            failure_threshold: defaults.failure_threshold,
            max_attempts: defaults.max_attempts,
            backoff_base_ms: defaults.backoff_base.as_millis() as u64,
            max_session_resets: defaults.max_session_resets,
            restart_trigger_delay_ms: defaults.restart_trigger_delay.as_millis() as u64,
            restart_cooldown_secs: defaults.restart_cooldown.as_secs(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Three-letter weekday, e.g. "Tue".
    pub weekday: String,
    pub start_hour: u32,
    pub start_minute: u32,
    pub duration_minutes: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let window = MaintenanceWindow::default();
        Self {
            weekday: window.weekday.to_string(),
            start_hour: window.start_hour,
            start_minute: window.start_minute,
            duration_minutes: window.duration_minutes,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    /// Talk to the bridge. When off, the in-memory paper service is used.
    pub enabled: bool,
    pub url: String,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:8787".into(),
            api_key_env: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    pub webhook_url_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    pub url: String,
    pub api_key_env: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: crate::services::probe::DEFAULT_PROBE_URL.into(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: crate::storage::DEFAULT_STATE_FILE.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 3030,
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        if config.balancer.fallback_value <= dec!(0) {
            anyhow::bail!("balancer.fallback_value must be positive");
        }
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve an optional env-var reference, treating unset as absent.
    pub fn resolve_optional(env_name: Option<&str>) -> Option<String> {
        env_name.and_then(|name| Self::resolve_env(name).ok())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_BRIDGE_URL) {
            self.bridge.url = url;
        }
        if let Ok(value) = std::env::var(ENV_DRY_RUN) {
            self.agent.dry_run = parse_flag(&value);
        }
        if let Ok(path) = std::env::var(ENV_STATE_FILE) {
            self.storage.state_file = path;
        }
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    pub fn engine_settings(&self) -> EngineSettings {
        let e = &self.engine;
        EngineSettings {
            retry: RetryPolicy {
                max_attempts: e.max_attempts.max(1),
                backoff_base: Duration::from_millis(e.backoff_base_ms),
                send_timeout_backoff_base: Duration::from_millis(e.send_timeout_backoff_base_ms),
            },
            action_retry_delay: Duration::from_secs(e.action_retry_delay_secs),
            retry_marker_ttl: Duration::from_secs(e.retry_marker_ttl_secs),
            inventory_retry_delay: Duration::from_secs(e.inventory_retry_delay_secs),
            poll_interval: Duration::from_secs(self.agent.poll_interval_secs),
            poll_summary_interval: Duration::from_secs(e.poll_summary_interval_secs),
            counter_message: e.counter_message.clone(),
            dry_run: self.agent.dry_run,
        }
    }

    pub fn escrow_settings(&self) -> Result<EscrowSettings> {
        let e = &self.escrow;
        let weekday: Weekday = e
            .maintenance
            .weekday
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid maintenance weekday: {}", e.maintenance.weekday))?;

        Ok(EscrowSettings {
            failure_threshold: e.failure_threshold.max(1),
            max_attempts: e.max_attempts.max(1),
            backoff_base: Duration::from_millis(e.backoff_base_ms),
            max_session_resets: e.max_session_resets,
            restart_trigger_delay: Duration::from_millis(e.restart_trigger_delay_ms),
            restart_cooldown: Duration::from_secs(e.restart_cooldown_secs),
            maintenance: MaintenanceWindow {
                weekday,
                start_hour: e.maintenance.start_hour,
                start_minute: e.maintenance.start_minute,
                duration_minutes: e.maintenance.duration_minutes,
            },
        })
    }

    pub fn balancer_options(&self) -> BalancerOptions {
        let b = &self.balancer;
        BalancerOptions {
            weapons_as_currency: b.weapons_as_currency,
            fallback_kinds: b.fallback_kinds.iter().map(Sku::new).collect(),
            fallback_value: b.fallback_value,
            show_only_metal: b.show_only_metal,
        }
    }

    pub fn currency_ladder(&self) -> Result<CurrencyLadder> {
        match &self.balancer.ladder {
            Some(ladder) => CurrencyLadder::new(Sku::new(&ladder.key), ladder.metals.clone())
                .context("Invalid [balancer.ladder] section"),
            None => Ok(CurrencyLadder::standard()),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
