//! Run controller: the lifecycle state machine for one run.
//!
//! PRECHECK -> INIT_STAGING -> UPLOAD_SIDELOADS -> POLL/MEASURE loop ->
//! SNAPSHOT (on growth) -> FINAL_SNAPSHOT (on sentinel) -> COMPOSE ->
//! EMIT_SIDECARS -> CLEANUP. Single-threaded and cooperative: the
//! shutdown flag is honored at every suspension point.

pub mod lock;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use ignore::WalkBuilder;
use tracing::{info, warn};

use crate::config::UploaderConfig;
use crate::encoder::{self, ChunkMeta, SnapshotRequest};
use crate::error::{HaulError, Result};
use crate::exclude::ExclusionPlan;
use crate::index::SnapshotIndex;
use crate::paths::RunPaths;
use crate::platform::{self, HostProbe};
use crate::sidecar::{self, Provenance};
use crate::storage::{self, ObjectStore};
use crate::upload::{self, RetrySchedule};

/// Files whose appearance signals that the instrument stopped writing.
pub const COMPLETION_SENTINELS: [&str; 2] = ["RTAComplete.txt", "RTAComplete.xml"];

const INDEX_FILE: &str = "snapshot.index.json";

#[derive(Debug, PartialEq, Eq)]
pub struct RunStats {
    pub increments: u64,
    pub compose_calls: usize,
    pub total_source_bytes: u64,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The final object already existed; nothing was touched.
    AlreadyUploaded,
    /// Another live controller owns this run's staging.
    AnotherInstanceActive { pid: u32 },
    Completed(RunStats),
}

/// Drive one run to completion.
pub fn run(
    config: &UploaderConfig,
    source: &Path,
    destination: &str,
    shutdown: &AtomicBool,
) -> Result<RunOutcome> {
    config.validate()?;

    if !source.is_dir() {
        return Err(HaulError::BadArguments(format!(
            "source is not a directory: {}",
            source.display()
        )));
    }
    let run_id = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            HaulError::BadArguments(format!("cannot derive run id from {}", source.display()))
        })?;

    let dest = storage::parse_destination(destination)?;
    let store = storage::store_for_destination(&dest, config.gcs_bearer_token.as_deref())?;
    let paths = RunPaths::new(&run_id, &dest);
    let probe = HostProbe::detect(config.staging_root.as_deref())?;

    // PRECHECK: idempotent re-entry.
    if store.exists(&paths.final_uri())? {
        info!(run = %run_id, uri = %paths.final_uri(), "final archive already present");
        return Ok(RunOutcome::AlreadyUploaded);
    }
    check_freshness(source, config)?;

    // INIT_STAGING.
    let staging_dir = probe.staging_root.join(&run_id);
    std::fs::create_dir_all(&staging_dir)?;
    let guard = match lock::acquire(&staging_dir)? {
        lock::LockState::Acquired(guard) => guard,
        lock::LockState::HeldByLive { pid } => {
            info!(run = %run_id, pid, "another uploader instance is active");
            return Ok(RunOutcome::AnotherInstanceActive { pid });
        }
    };

    let ctl = Controller {
        config,
        probe: &probe,
        store: store.as_ref(),
        paths: &paths,
        source,
        staging_dir: &staging_dir,
        index_path: staging_dir.join(INDEX_FILE),
        destination,
        shutdown,
    };

    let result = ctl.drive();
    guard.release();
    match &result {
        Ok(_) | Err(HaulError::Interrupted) => {
            if let Err(e) = std::fs::remove_dir_all(&staging_dir) {
                warn!(dir = %staging_dir.display(), error = %e, "staging cleanup failed");
            }
        }
        Err(e) => {
            info!(
                dir = %staging_dir.display(),
                error = %e,
                "staging retained for resume"
            );
        }
    }
    result.map(RunOutcome::Completed)
}

struct Controller<'a> {
    config: &'a UploaderConfig,
    probe: &'a HostProbe,
    store: &'a dyn ObjectStore,
    paths: &'a RunPaths,
    source: &'a Path,
    staging_dir: &'a Path,
    index_path: PathBuf,
    destination: &'a str,
    shutdown: &'a AtomicBool,
}

impl Controller<'_> {
    fn drive(&self) -> Result<RunStats> {
        let start_wall = Utc::now();
        let started = Instant::now();
        let schedule = RetrySchedule {
            max_attempts: self.config.retry_max_attempts,
            base_delay: Duration::from_secs(self.config.retry_delay_sec),
        };

        self.recover_staged_chunk(&schedule)?;
        self.upload_sideloads()?;

        let mut increments = SnapshotIndex::load(&self.index_path)?.generation;
        if increments > 0 {
            info!(run = %self.paths.run_id, increments, "resuming from persisted index");
        }
        let mut size_at_last_snapshot = 0u64;
        let mut last_timestamp = 0i64;
        let mut total_bytes;

        loop {
            platform::sync_filesystems();
            upload::interruptible_sleep(self.config.poll_interval(), self.shutdown)?;

            total_bytes = self.measure()?;
            if self.sentinel_present() {
                info!(run = %self.paths.run_id, "completion sentinel observed");
                break;
            }
            if total_bytes.saturating_sub(size_at_last_snapshot) >= self.config.chunk_size_bytes()
            {
                increments = self.take_snapshot(false, &schedule, &mut last_timestamp)?;
                size_at_last_snapshot = total_bytes;
                continue;
            }
            if started.elapsed() >= self.config.run_timeout() {
                return Err(HaulError::Timeout(format!(
                    "no completion sentinel after {} days",
                    self.config.run_completion_timeout_days
                )));
            }
        }

        // FINAL_SNAPSHOT: let in-flight instrument writes land, then take
        // everything that was ever deferred.
        platform::sync_filesystems();
        upload::interruptible_sleep(self.config.quiesce(), self.shutdown)?;
        increments = self.take_snapshot(true, &schedule, &mut last_timestamp)?;
        total_bytes = self.measure()?;

        let compose_stats = crate::compose::compose_parts(
            self.store,
            &self.paths.final_uri(),
            &self.paths.parts_prefix(),
            self.config.compose_settle(),
            self.shutdown,
        )?;

        let finished_wall = Utc::now();
        let run_path = self.source.to_string_lossy();
        let provenance = Provenance {
            run_basename: &self.paths.run_id,
            run_path: &run_path,
            destination: self.destination,
            started_at: start_wall.to_rfc3339(),
            finished_at: finished_wall.to_rfc3339(),
            duration_secs: started.elapsed().as_secs(),
            increments,
            total_source_bytes: total_bytes,
            cron_invoked: self.config.cron_invoked,
            host: &self.probe.hostname,
            user: &self.probe.user,
            ip: &self.probe.ip,
            os: &self.probe.os,
            arch: &self.probe.arch,
            uploader_version: env!("CARGO_PKG_VERSION"),
            config: self.config,
            exclusions: &self.config.static_exclusions,
        };
        sidecar::emit_all(self.store, self.paths, &provenance, &self.config.terra_table)?;

        Ok(RunStats {
            increments,
            compose_calls: compose_stats.compose_calls,
            total_source_bytes: total_bytes,
        })
    }

    /// Finish the work of a predecessor that died mid-shipment.
    ///
    /// A staged chunk alongside a pending index is fully emitted and may
    /// already be remote; the upload pipeline's list-check resumes it
    /// without creating a second copy under a new timestamp. A chunk with
    /// no pending index was torn mid-emit and never indexed, so it is
    /// deleted and its deltas re-emitted by the next snapshot.
    fn recover_staged_chunk(&self, schedule: &RetrySchedule) -> Result<()> {
        let mut staged = staged_chunks(self.staging_dir)?;
        if staged.is_empty() {
            return Ok(());
        }
        if !crate::index::pending_path(&self.index_path).exists() {
            for torn in staged {
                warn!(chunk = %torn.display(), "removing torn staged chunk");
                let _ = std::fs::remove_file(torn);
            }
            return Ok(());
        }
        let Some(resumed) = staged.pop() else {
            return Ok(());
        };
        // Only the newest chunk matches the pending index state.
        for superseded in staged {
            warn!(chunk = %superseded.display(), "removing superseded staged chunk");
            let _ = std::fs::remove_file(superseded);
        }
        info!(chunk = %resumed.display(), "resuming interrupted chunk shipment");
        upload::ship_chunk(
            self.store,
            &resumed,
            &self.paths.parts_prefix(),
            &self.index_path,
            schedule,
            self.shutdown,
        )
    }

    /// SampleSheet and RunInfo travel as standalone objects too, so they
    /// are readable without pulling the archive.
    fn upload_sideloads(&self) -> Result<()> {
        let sideloads = [
            ("SampleSheet.csv", self.paths.samplesheet_uri()),
            ("RunInfo.xml", self.paths.runinfo_uri()),
        ];
        for (name, uri) in sideloads {
            let local = self.source.join(name);
            if !local.is_file() {
                continue;
            }
            if self.store.exists(&uri)? {
                continue;
            }
            self.store.upload(&local, &uri)?;
            info!(object = %uri, "sideload uploaded");
        }
        Ok(())
    }

    fn take_snapshot(
        &self,
        is_final: bool,
        schedule: &RetrySchedule,
        last_timestamp: &mut i64,
    ) -> Result<u64> {
        let plan = ExclusionPlan::compute(
            self.source,
            &self.config.static_exclusions,
            Duration::from_secs(self.config.recent_file_window_sec),
            is_final,
        );
        let increment = SnapshotIndex::load(&self.index_path)?.generation + 1;

        // Chunk names must stay strictly ordered even when snapshots land
        // within the same second.
        let timestamp = Utc::now().timestamp().max(*last_timestamp + 1);
        *last_timestamp = timestamp;

        let outcome = encoder::snapshot(&SnapshotRequest {
            source_root: self.source,
            index_path: &self.index_path,
            staging_dir: self.staging_dir,
            plan: &plan,
            is_final,
            compare_device: !self.config.source_is_nfs,
            meta: ChunkMeta {
                run_id_short: self.paths.run_id_short().to_string(),
                timestamp,
                increment,
                host: self.probe.hostname.clone(),
                user: self.probe.user.clone(),
                ip: self.probe.ip.clone(),
                cron: u8::from(self.config.cron_invoked),
            },
        })?;

        upload::ship_chunk(
            self.store,
            &outcome.chunk_path,
            &self.paths.parts_prefix(),
            &self.index_path,
            schedule,
            self.shutdown,
        )?;
        Ok(outcome.generation)
    }

    /// Total byte size of the source tree, staying on the source's
    /// filesystem.
    fn measure(&self) -> Result<u64> {
        let root_meta = std::fs::symlink_metadata(self.source)?;
        let root_dev = crate::platform::fs::summarize_metadata(&root_meta).device;

        let mut walker = WalkBuilder::new(self.source);
        walker.follow_links(false);
        walker.hidden(false);
        walker.ignore(false);
        walker.git_global(false);
        walker.git_ignore(false);
        walker.git_exclude(false);
        walker.require_git(false);
        walker.filter_entry(move |entry| {
            if !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                return true;
            }
            match std::fs::symlink_metadata(entry.path()) {
                Ok(meta) => crate::platform::fs::summarize_metadata(&meta).device == root_dev,
                Err(_) => false,
            }
        });

        let mut total = 0u64;
        for entry in walker.build() {
            let Ok(entry) = entry else { continue };
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    fn sentinel_present(&self) -> bool {
        COMPLETION_SENTINELS
            .iter()
            .any(|name| self.source.join(name).exists())
    }
}

/// Abort before doing any work when the run stopped being written long
/// ago; something upstream failed and an operator should look.
fn check_freshness(source: &Path, config: &UploaderConfig) -> Result<()> {
    let runinfo = source.join("RunInfo.xml");
    let Ok(meta) = std::fs::metadata(&runinfo) else {
        // Absent RunInfo means the run just started; the poll-loop
        // timeout still bounds it.
        return Ok(());
    };
    let Ok(modified) = meta.modified() else {
        return Ok(());
    };
    if let Ok(age) = SystemTime::now().duration_since(modified) {
        if age > config.run_timeout() {
            return Err(HaulError::StaleRun(format!(
                "RunInfo.xml is {} days old (limit {})",
                age.as_secs() / 86_400,
                config.run_completion_timeout_days
            )));
        }
    }
    Ok(())
}

/// Staged chunk files, oldest first by embedded timestamp.
fn staged_chunks(staging_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut chunks = Vec::new();
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().ends_with("_part-1.tar.gz") {
            chunks.push(entry.path());
        }
    }
    chunks.sort_by(|a, b| {
        let an = a.file_name().map(|n| n.to_string_lossy().to_string());
        let bn = b.file_name().map(|n| n.to_string_lossy().to_string());
        crate::storage::version_cmp(
            an.as_deref().unwrap_or_default(),
            bn.as_deref().unwrap_or_default(),
        )
    });
    Ok(chunks)
}
