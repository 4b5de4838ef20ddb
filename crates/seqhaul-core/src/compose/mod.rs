//! Server-side composition of staged chunks into the final archive.
//!
//! The running target is always the leftmost source, so the archive's
//! logical order equals emission order, and each call carries at most 31
//! parts to stay inside the 32-source fan-in bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

use crate::error::{HaulError, Result};
use crate::storage::{ObjectStore, COMPOSE_FANIN_MAX};

/// Parts folded per compose call; one slot is reserved for the target.
const BATCH: usize = COMPOSE_FANIN_MAX - 1;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ComposeStats {
    pub compose_calls: usize,
    pub parts_folded: usize,
}

/// Fold everything under `parts_prefix` into `final_uri`.
///
/// Termination is list-driven: the loop runs until the parts listing
/// comes back empty, so parts that arrive while composing are folded
/// too. Each iteration is compose → settle → delete; the settle sleep
/// tolerates the store's eventual-consistency lag before the sources
/// are removed. The shutdown flag is honored only between iterations —
/// a composed-but-undeleted batch would be folded twice on rerun.
pub fn compose_parts(
    store: &dyn ObjectStore,
    final_uri: &str,
    parts_prefix: &str,
    settle: Duration,
    shutdown: &AtomicBool,
) -> Result<ComposeStats> {
    if !store.exists(final_uri)? {
        let mut empty: &[u8] = &[];
        store.upload_stream(&mut empty, final_uri)?;
        info!(target = %final_uri, "created empty composition target");
    }

    let mut stats = ComposeStats::default();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Err(HaulError::Interrupted);
        }

        let parts = store.list(parts_prefix, "*.tar.gz")?;
        if parts.is_empty() {
            break;
        }

        let batch: Vec<String> = parts.into_iter().take(BATCH).collect();
        let mut sources = Vec::with_capacity(batch.len() + 1);
        sources.push(final_uri.to_string());
        sources.extend(batch.iter().cloned());

        store.compose(final_uri, &sources)?;
        stats.compose_calls += 1;
        stats.parts_folded += batch.len();
        info!(
            call = stats.compose_calls,
            folded = batch.len(),
            total = stats.parts_folded,
            "composed batch into target"
        );

        std::thread::sleep(settle);
        store.delete_many(&batch)?;
    }

    Ok(stats)
}
