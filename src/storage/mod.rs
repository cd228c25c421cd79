//! Poll-data persistence.
//!
//! Known proposal states and their metadata are saved to a JSON file so a
//! restarted process can rebuild its ownership set and skip proposals it
//! already handled.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::types::PollData;

/// Default poll-data file path.
pub const DEFAULT_STATE_FILE: &str = "poll_data.json";

/// Save poll data. The file is replaced atomically.
pub fn save_poll_data(poll: &PollData, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(poll).context("Failed to serialise poll data")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("Failed to write poll data to {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move poll data into {path}"))?;

    debug!(
        path,
        sent = poll.sent.len(),
        received = poll.received.len(),
        "Poll data saved"
    );
    Ok(())
}

/// Load poll data. Returns `None` if the file doesn't exist (fresh start).
pub fn load_poll_data(path: Option<&str>) -> Result<Option<PollData>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved poll data found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read poll data from {path}"))?;
    let poll: PollData = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse poll data from {path}"))?;

    info!(
        path,
        sent = poll.sent.len(),
        received = poll.received.len(),
        offers = poll.offer_data.len(),
        "Poll data loaded from disk"
    );
    Ok(Some(poll))
}

/// Delete the poll-data file (for testing or reset).
pub fn delete_poll_data(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete poll data file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
