//! Self-restart through an external process manager.
//!
//! When the process manager's marker variable is present, a restart request
//! signals the main loop, which exits with a non-zero status so the manager
//! starts a fresh process.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::ProcessSupervisor;

/// Environment variable set by the process manager for supervised children.
pub const SUPERVISOR_ENV: &str = "pm_id";

pub struct EnvSupervisor {
    supervised: bool,
    signal: Arc<Notify>,
}

impl EnvSupervisor {
    /// Detect the process manager from the environment.
    pub fn from_env(signal: Arc<Notify>) -> Self {
        Self::new(std::env::var_os(SUPERVISOR_ENV).is_some(), signal)
    }

    pub fn new(supervised: bool, signal: Arc<Notify>) -> Self {
        Self { supervised, signal }
    }

    pub fn is_supervised(&self) -> bool {
        self.supervised
    }
}

#[async_trait]
impl ProcessSupervisor for EnvSupervisor {
    async fn restart(&self) -> Result<bool> {
        if !self.supervised {
            warn!("Restart requested but no process manager is present");
            return Ok(false);
        }
        info!("Signalling main loop to exit for restart");
        self.signal.notify_one();
        Ok(true)
    }
}
