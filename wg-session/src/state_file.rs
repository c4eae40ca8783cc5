// Status file writer for external monitoring
//!
//! Writes the current connection status to `<runtime_dir>/state` for
//! consumption by shell scripts and status bar widgets.

use crate::controller::StatusSnapshot;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const STATE_FILE: &str = "state";

/// Path of the status file inside `runtime_dir`
pub fn state_file_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(STATE_FILE)
}

/// Write current status to the status file
pub fn write_status(runtime_dir: &Path, status: StatusSnapshot) -> Result<()> {
    // Create directory if it doesn't exist
    if !runtime_dir.exists() {
        fs::create_dir_all(runtime_dir).context("Failed to create runtime directory")?;
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let content = format!(
        "STATE={}\nACTIVE={}\nTIMESTAMP={}\n",
        status.state, status.active, timestamp
    );

    // Replace atomically so readers never see a partial file
    let path = state_file_path(runtime_dir);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).context("Failed to write state file")?;
    fs::rename(&tmp, &path).context("Failed to replace state file")?;

    Ok(())
}

/// Remove status file on shutdown
pub fn cleanup(runtime_dir: &Path) {
    let _ = fs::remove_file(state_file_path(runtime_dir));
}
