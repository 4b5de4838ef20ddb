mod defaults;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use defaults::*;

/// All knobs of a single uploader run.
///
/// The library never reads the environment; the launcher translates
/// environment variables into this structure and hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Snapshot trigger threshold: new bytes observed since the last snapshot.
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,

    /// Sleep between poll iterations.
    #[serde(default = "default_delay_between_increments_sec")]
    pub delay_between_increments_sec: u64,

    /// Wall-clock bound on the whole run; also the staleness bound on
    /// `RunInfo.xml` at pre-check.
    #[serde(default = "default_run_completion_timeout_days")]
    pub run_completion_timeout_days: u64,

    /// Staging root override. When unset the platform probe picks one.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,

    /// Upload retry bound per chunk.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Base retry delay; attempt N waits `N * retry_delay_sec`.
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,

    /// Table name used in the tabular-import sidecar header.
    #[serde(default = "default_terra_table")]
    pub terra_table: String,

    /// Directory names excluded from every snapshot.
    #[serde(default = "default_static_exclusions")]
    pub static_exclusions: Vec<String>,

    /// Disables device-number comparison in the incremental index; NFS
    /// remounts renumber devices and would make every file look moved.
    #[serde(default = "default_source_is_nfs")]
    pub source_is_nfs: bool,

    /// Whether this run was launched non-interactively.
    #[serde(default)]
    pub cron_invoked: bool,

    /// Settle time between the filesystem sync hint and the final snapshot.
    #[serde(default = "default_quiesce_sec")]
    pub quiesce_sec: u64,

    /// Settle time after each compose before deleting its sources.
    #[serde(default = "default_compose_settle_sec")]
    pub compose_settle_sec: u64,

    /// Files modified within this window are deferred to a later snapshot.
    #[serde(default = "default_recent_file_window_sec")]
    pub recent_file_window_sec: u64,

    /// Bearer token for the GCS backend. Unused for local destinations.
    #[serde(default)]
    pub gcs_bearer_token: Option<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            delay_between_increments_sec: default_delay_between_increments_sec(),
            run_completion_timeout_days: default_run_completion_timeout_days(),
            staging_root: None,
            retry_max_attempts: default_retry_max_attempts(),
            retry_delay_sec: default_retry_delay_sec(),
            terra_table: default_terra_table(),
            static_exclusions: default_static_exclusions(),
            source_is_nfs: default_source_is_nfs(),
            cron_invoked: false,
            quiesce_sec: default_quiesce_sec(),
            compose_settle_sec: default_compose_settle_sec(),
            recent_file_window_sec: default_recent_file_window_sec(),
            gcs_bearer_token: None,
        }
    }
}

impl UploaderConfig {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.delay_between_increments_sec)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_completion_timeout_days * 24 * 3600)
    }

    pub fn quiesce(&self) -> Duration {
        Duration::from_secs(self.quiesce_sec)
    }

    pub fn compose_settle(&self) -> Duration {
        Duration::from_secs(self.compose_settle_sec)
    }

    /// Reject configurations that can never make progress.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.chunk_size_mb == 0 {
            return Err(crate::error::HaulError::Config(
                "chunk_size_mb must be non-zero".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(crate::error::HaulError::Config(
                "retry_max_attempts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
