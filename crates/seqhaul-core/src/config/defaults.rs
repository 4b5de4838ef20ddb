//! Default values for [`UploaderConfig`](super::UploaderConfig) fields.

pub(super) fn default_chunk_size_mb() -> u64 {
    100
}

pub(super) fn default_delay_between_increments_sec() -> u64 {
    600
}

pub(super) fn default_run_completion_timeout_days() -> u64 {
    16
}

pub(super) fn default_retry_max_attempts() -> u32 {
    12
}

pub(super) fn default_retry_delay_sec() -> u64 {
    600
}

pub(super) fn default_terra_table() -> String {
    "flowcell".to_string()
}

pub(super) fn default_source_is_nfs() -> bool {
    true
}

pub(super) fn default_quiesce_sec() -> u64 {
    10
}

pub(super) fn default_compose_settle_sec() -> u64 {
    10
}

pub(super) fn default_recent_file_window_sec() -> u64 {
    180
}

/// Instrument-generated directories that never belong in the archive.
pub(super) fn default_static_exclusions() -> Vec<String> {
    [
        "Thumbnail_Images",
        "Images",
        "FocusModelGeneration",
        "Autocenter",
        "InstrumentAnalyticsLogs",
        "Logs",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
