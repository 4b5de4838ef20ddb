use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{HaulError, Result};
use crate::storage::{check_compose_fanin, glob_match, sort_by_version, ObjectStore};

/// Object store backed by the local filesystem, addressed by plain paths.
/// Used by the test suite and for dev runs against a mounted destination.
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for LocalStore {
    fn exists(&self, uri: &str) -> Result<bool> {
        match fs::metadata(uri) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn upload(&self, local: &Path, uri: &str) -> Result<()> {
        let dest = PathBuf::from(uri);
        Self::ensure_parent(&dest)?;
        fs::copy(local, &dest)?;
        Ok(())
    }

    fn upload_stream(&self, reader: &mut dyn Read, uri: &str) -> Result<()> {
        let dest = PathBuf::from(uri);
        Self::ensure_parent(&dest)?;
        let mut out = fs::File::create(&dest)?;
        std::io::copy(reader, &mut out)?;
        out.flush()?;
        Ok(())
    }

    fn list(&self, prefix: &str, glob: &str) -> Result<Vec<String>> {
        let dir = PathBuf::from(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut uris = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if glob_match(glob, &name) {
                uris.push(entry.path().to_string_lossy().to_string());
            }
        }
        sort_by_version(&mut uris);
        Ok(uris)
    }

    fn compose(&self, target: &str, sources: &[String]) -> Result<()> {
        check_compose_fanin(sources)?;
        let target_path = PathBuf::from(target);
        Self::ensure_parent(&target_path)?;

        // Concatenate into a sibling tempfile, then rename over the target so
        // a crash mid-compose never leaves a torn object.
        let tmp = target_path.with_extension("compose-tmp");
        {
            let mut out = fs::File::create(&tmp)?;
            for source in sources {
                let mut input = fs::File::open(source).map_err(|e| {
                    HaulError::Storage(format!("compose source '{source}': {e}"))
                })?;
                std::io::copy(&mut input, &mut out)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &target_path)?;
        Ok(())
    }

    fn delete(&self, uri: &str) -> Result<()> {
        match fs::remove_file(uri) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
