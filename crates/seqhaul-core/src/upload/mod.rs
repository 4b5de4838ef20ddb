//! Durable chunk shipment: stage → transfer with bounded retry → verify →
//! delete local → commit the pending index.
//!
//! Uploads are serial per run; a chunk is fully durable before the next
//! snapshot starts, so the committed index never runs ahead of remote
//! state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{HaulError, Result};
use crate::storage::{basename, ObjectStore};

/// Linear retry schedule: attempt N is followed by a delay of
/// `base * N`. Pure so tests can assert the exact sequence.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetrySchedule {
    /// Delay to sleep after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Ship one staged chunk into `<parts_prefix>/<basename>`.
///
/// Skips the transfer when the object already exists remotely (a prior
/// invocation died between upload and local delete), then deletes the
/// local copy and commits the pending index. Either way the chunk is
/// durable when this returns `Ok`.
pub fn ship_chunk(
    store: &dyn ObjectStore,
    chunk_path: &Path,
    parts_prefix: &str,
    index_path: &Path,
    schedule: &RetrySchedule,
    shutdown: &AtomicBool,
) -> Result<()> {
    let name = chunk_path
        .file_name()
        .ok_or_else(|| HaulError::BadArguments(format!("not a file: {}", chunk_path.display())))?
        .to_string_lossy()
        .to_string();
    let target_uri = format!("{parts_prefix}/{name}");

    let already_there = store
        .list(parts_prefix, "*.tar.gz")?
        .iter()
        .any(|uri| basename(uri) == name);

    if already_there {
        info!(chunk = %name, "chunk already durable, skipping upload");
    } else {
        transfer_with_retry(store, chunk_path, &target_uri, schedule, shutdown)?;
    }

    std::fs::remove_file(chunk_path)?;
    crate::index::commit_pending(index_path)?;
    info!(chunk = %name, "chunk durable, index advanced");
    Ok(())
}

fn transfer_with_retry(
    store: &dyn ObjectStore,
    chunk_path: &Path,
    target_uri: &str,
    schedule: &RetrySchedule,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut last_error = String::new();
    for attempt in 1..=schedule.max_attempts {
        if shutdown.load(Ordering::SeqCst) {
            return Err(HaulError::Interrupted);
        }
        match store.upload(chunk_path, target_uri) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                warn!(
                    attempt,
                    max = schedule.max_attempts,
                    uri = %target_uri,
                    error = %last_error,
                    "chunk upload failed"
                );
                if attempt < schedule.max_attempts {
                    interruptible_sleep(schedule.delay(attempt), shutdown)?;
                }
            }
        }
    }
    Err(HaulError::UploadFailed {
        attempts: schedule.max_attempts,
        detail: last_error,
    })
}

/// Sleep in slices so a termination signal is honored promptly.
pub(crate) fn interruptible_sleep(total: Duration, shutdown: &AtomicBool) -> Result<()> {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return Err(HaulError::Interrupted);
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    if shutdown.load(Ordering::SeqCst) {
        return Err(HaulError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_scales_linearly() {
        let schedule = RetrySchedule {
            max_attempts: 12,
            base_delay: Duration::from_secs(600),
        };
        assert_eq!(schedule.delay(1), Duration::from_secs(600));
        assert_eq!(schedule.delay(2), Duration::from_secs(1200));
        assert_eq!(schedule.delay(3), Duration::from_secs(1800));
    }

    #[test]
    fn preset_shutdown_interrupts_sleep() {
        let shutdown = AtomicBool::new(true);
        let err = interruptible_sleep(Duration::from_secs(60), &shutdown).unwrap_err();
        assert!(matches!(err, HaulError::Interrupted));
    }
}
