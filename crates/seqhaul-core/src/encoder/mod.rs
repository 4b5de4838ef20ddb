//! Incremental tar encoder.
//!
//! One call produces one gzipped, concatenable chunk holding exactly the
//! deltas between the persisted index state and the source tree, and
//! stages the post-snapshot index as `<index>.pending`. Committing the
//! pending index belongs to the upload pipeline, after the chunk is
//! durable.

mod gate;
pub mod header;
pub mod label;
mod sparse;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use crate::error::{HaulError, Result};
use crate::exclude::ExclusionPlan;
use crate::index::{IndexEntry, SnapshotIndex};
use crate::platform::fs::{summarize_metadata, EntryKind, MetadataSummary};
use gate::TrailerGate;
use header::TarWriter;
pub use label::ChunkMeta;

#[derive(Debug)]
pub struct SnapshotRequest<'a> {
    pub source_root: &'a Path,
    pub index_path: &'a Path,
    pub staging_dir: &'a Path,
    pub plan: &'a ExclusionPlan,
    pub is_final: bool,
    /// Off for NFS sources, where remounts renumber devices.
    pub compare_device: bool,
    pub meta: ChunkMeta,
}

#[derive(Debug)]
pub struct SnapshotOutcome {
    pub chunk_path: PathBuf,
    /// Members emitted into this chunk, volume label excluded.
    pub members: usize,
    /// Uncompressed payload bytes emitted.
    pub bytes: u64,
    /// Generation recorded in the staged pending index.
    pub generation: u64,
    /// Files deferred by the recent-mtime rule.
    pub deferred: usize,
}

/// Take one incremental snapshot of the source tree.
pub fn snapshot(req: &SnapshotRequest) -> Result<SnapshotOutcome> {
    let prior = SnapshotIndex::load(req.index_path)?;
    // A pending file here means a chunk was lost before upload; the live
    // index is the durable truth, so the stale pending state is dropped
    // and its deltas re-emitted now.
    crate::index::discard_pending(req.index_path);

    let mut next = prior.successor();

    let chunk_path = req
        .staging_dir
        .join(format!("{}_part-1.tar.gz", req.meta.timestamp));

    match emit_chunk(req, &prior, &mut next, &chunk_path) {
        Ok((members, bytes, deferred)) => {
            next.write_pending(req.index_path)?;
            info!(
                chunk = %chunk_path.display(),
                members,
                bytes,
                deferred,
                generation = next.generation,
                "snapshot emitted"
            );
            Ok(SnapshotOutcome {
                chunk_path,
                members,
                bytes,
                generation: next.generation,
                deferred,
            })
        }
        Err(e) => {
            let _ = std::fs::remove_file(&chunk_path);
            Err(match e {
                HaulError::Io(io) => HaulError::SnapshotFailed(io.to_string()),
                other => other,
            })
        }
    }
}

fn emit_chunk(
    req: &SnapshotRequest,
    prior: &SnapshotIndex,
    next: &mut SnapshotIndex,
    chunk_path: &Path,
) -> Result<(usize, u64, usize)> {
    let matcher = req.plan.matcher(req.source_root)?;

    let out = File::create(chunk_path)?;
    let gz = GzEncoder::new(BufWriter::new(out), Compression::default());
    let mut gated = TrailerGate::new(gz);

    let mut members = 0usize;
    let mut bytes = 0u64;
    let mut deferred = 0usize;

    {
        let mut tar = TarWriter::new(&mut gated);
        tar.append_label(&label::encode_label(&req.meta)?)?;

        let source_root = req.source_root.to_path_buf();
        let mut walker = WalkBuilder::new(&source_root);
        walker.follow_links(false);
        walker.hidden(false);
        walker.ignore(false);
        walker.git_global(false);
        walker.git_ignore(false);
        walker.git_exclude(false);
        walker.require_git(false);
        walker.sort_by_file_name(std::ffi::OsStr::cmp);
        let filter_root = source_root.clone();
        let filter_matcher = matcher;
        walker.filter_entry(move |entry| {
            let path = entry.path();
            if path == filter_root {
                return true;
            }
            let rel = path.strip_prefix(&filter_root).unwrap_or(path);
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !filter_matcher
                .matched_path_or_any_parents(rel, is_dir)
                .is_ignore()
        });

        for entry_result in walker.build() {
            let entry = match entry_result {
                Ok(e) => e,
                Err(e) => {
                    if is_soft_walk_error(&e) {
                        warn!(error = %e, "skipping entry (walk error)");
                        continue;
                    }
                    return Err(HaulError::SnapshotFailed(format!("walk error: {e}")));
                }
            };

            let rel = entry
                .path()
                .strip_prefix(&source_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if rel.is_empty() {
                continue;
            }

            let metadata = match std::fs::symlink_metadata(entry.path()) {
                Ok(m) => m,
                Err(e) if is_soft_io_error(&e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping entry (stat error)");
                    continue;
                }
                Err(e) => {
                    return Err(HaulError::SnapshotFailed(format!(
                        "stat {}: {e}",
                        entry.path().display()
                    )))
                }
            };
            let summary = summarize_metadata(&metadata);

            if summary.kind == EntryKind::Unsupported {
                debug!(path = %rel, "skipping unsupported file type");
                continue;
            }

            if summary.kind == EntryKind::Regular
                && !req.is_final
                && req.plan.is_too_recent(mtime_of(&summary))
            {
                deferred += 1;
                continue;
            }

            let current = IndexEntry {
                device: summary.device,
                inode: summary.inode,
                mtime_ns: summary.mtime_ns,
                size: summary.size,
            };
            if !prior.is_changed(&rel, &current, req.compare_device) {
                next.record(rel, current);
                continue;
            }

            // Record only what was actually emitted; a file that vanished
            // between stat and open must stay absent from the index.
            if append_member(&mut tar, entry.path(), &rel, &summary)? {
                next.record(rel, current);
                members += 1;
                bytes += summary.size;
            }
        }

        tar.finish()?;
    }

    let gz = gated
        .finish(req.is_final)
        .map_err(|e| HaulError::SnapshotFailed(format!("trailer gate: {e}")))?;
    let mut inner = gz
        .finish()
        .map_err(|e| HaulError::SnapshotFailed(format!("gzip: {e}")))?;
    inner.flush()?;
    inner
        .into_inner()
        .map_err(|e| HaulError::SnapshotFailed(format!("chunk flush: {e}")))?
        .sync_all()?;

    Ok((members, bytes, deferred))
}

/// Returns `false` when the entry vanished before it could be read.
fn append_member<W: Write>(
    tar: &mut TarWriter<'_, W>,
    abs: &Path,
    rel: &str,
    summary: &MetadataSummary,
) -> Result<bool> {
    match summary.kind {
        EntryKind::Directory => tar.append_dir(rel, summary)?,
        EntryKind::Symlink => {
            let target = std::fs::read_link(abs)?;
            tar.append_symlink(rel, &target.to_string_lossy(), summary)?;
        }
        EntryKind::Fifo | EntryKind::CharDevice | EntryKind::BlockDevice => {
            tar.append_special(rel, summary)?;
        }
        EntryKind::Regular => {
            let mut file = match File::open(abs) {
                Ok(f) => f,
                Err(e) if is_soft_io_error(&e) => {
                    warn!(path = %rel, error = %e, "file vanished before read, skipping");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if summary.looks_sparse() {
                let regions = sparse::scan_regions(&file, summary.size);
                tar.append_sparse(rel, summary, &regions, &mut file)?;
            } else {
                tar.append_regular(rel, summary, &mut file)?;
            }
        }
        EntryKind::Unsupported => return Ok(false),
    }
    Ok(true)
}

fn mtime_of(summary: &MetadataSummary) -> SystemTime {
    if summary.mtime_ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(summary.mtime_ns as u64)
    } else {
        UNIX_EPOCH
    }
}

/// I/O errors safe to skip mid-walk: the instrument is still writing.
fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

fn is_soft_walk_error(e: &ignore::Error) -> bool {
    e.io_error().is_some_and(is_soft_io_error)
}
