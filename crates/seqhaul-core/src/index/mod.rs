//! Persistent snapshot index: the single source of truth for what has
//! already been emitted into durable chunks.
//!
//! Advancement is two-phase. The encoder writes the post-snapshot state to
//! a sibling `<index>.pending` file (tempfile + rename, atomic); the
//! pending file is renamed onto the live index only after the chunk it
//! describes has been durably uploaded. The live index therefore never
//! reflects a file version that is not yet remote.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HaulError, Result};

/// Filesystem metadata captured for one entry at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub device: u64,
    pub inode: u64,
    pub mtime_ns: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotIndex {
    /// Number of snapshots committed so far; the next snapshot is
    /// increment `generation + 1`.
    pub generation: u64,
    entries: HashMap<String, IndexEntry>,
}

impl SnapshotIndex {
    /// Load the live index. A missing file yields the empty first-run
    /// index; an unparsable file is `IndexCorrupt`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no index yet, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| HaulError::IndexCorrupt {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Empty index for the snapshot that follows this one.
    pub fn successor(&self) -> SnapshotIndex {
        SnapshotIndex {
            generation: self.generation + 1,
            entries: HashMap::new(),
        }
    }

    /// Whether `rel_path` differs from the indexed state.
    ///
    /// With `compare_device` off (NFS sources) the device number is
    /// ignored; remounts renumber devices without touching file content.
    pub fn is_changed(&self, rel_path: &str, current: &IndexEntry, compare_device: bool) -> bool {
        match self.entries.get(rel_path) {
            None => true,
            Some(prior) => {
                prior.inode != current.inode
                    || prior.mtime_ns != current.mtime_ns
                    || prior.size != current.size
                    || (compare_device && prior.device != current.device)
            }
        }
    }

    pub fn record(&mut self, rel_path: String, entry: IndexEntry) {
        self.entries.insert(rel_path, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write this state to `<index>.pending` atomically.
    pub fn write_pending(&self, index_path: &Path) -> Result<PathBuf> {
        let pending = pending_path(index_path);
        let tmp = index_path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, &pending)?;
        Ok(pending)
    }
}

pub fn pending_path(index_path: &Path) -> PathBuf {
    let mut os = index_path.as_os_str().to_owned();
    os.push(".pending");
    PathBuf::from(os)
}

/// Rename the pending index onto the live one. Called only after the chunk
/// emitted with that state is durable.
pub fn commit_pending(index_path: &Path) -> Result<()> {
    std::fs::rename(pending_path(index_path), index_path)?;
    Ok(())
}

/// Drop an uncommitted pending index, e.g. after a failed snapshot.
pub fn discard_pending(index_path: &Path) {
    let _ = std::fs::remove_file(pending_path(index_path));
}
