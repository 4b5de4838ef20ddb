use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use crate::config::UploaderConfig;
use crate::error::{HaulError, Result};
use crate::storage::local_backend::LocalStore;
use crate::storage::ObjectStore;

/// Config with every delay zeroed so tests run at full speed.
pub fn test_config(staging_root: &Path) -> UploaderConfig {
    UploaderConfig {
        chunk_size_mb: 1,
        delay_between_increments_sec: 0,
        staging_root: Some(staging_root.to_path_buf()),
        retry_delay_sec: 0,
        quiesce_sec: 0,
        compose_settle_sec: 0,
        recent_file_window_sec: 0,
        source_is_nfs: false,
        ..Default::default()
    }
}

/// Write a file, creating parents.
pub fn write_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Local store that injects upload failures and records every call, for
/// exercising the retry pipeline without a network.
pub struct FlakyStore {
    inner: LocalStore,
    /// basename -> number of upload attempts that must still fail.
    failures: Mutex<HashMap<String, u32>>,
    pub upload_attempts: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: LocalStore::new(),
            failures: Mutex::new(HashMap::new()),
            upload_attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_uploads_of(&self, basename: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(basename.to_string(), times);
    }

    pub fn attempts_for(&self, basename: &str) -> usize {
        self.upload_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|uri| crate::storage::basename(uri) == basename)
            .count()
    }
}

impl ObjectStore for FlakyStore {
    fn exists(&self, uri: &str) -> Result<bool> {
        self.inner.exists(uri)
    }

    fn upload(&self, local: &Path, uri: &str) -> Result<()> {
        self.upload_attempts.lock().unwrap().push(uri.to_string());
        let name = crate::storage::basename(uri).to_string();
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HaulError::Storage(format!("injected failure for {name}")));
            }
        }
        drop(failures);
        self.inner.upload(local, uri)
    }

    fn upload_stream(&self, reader: &mut dyn Read, uri: &str) -> Result<()> {
        self.inner.upload_stream(reader, uri)
    }

    fn list(&self, prefix: &str, glob: &str) -> Result<Vec<String>> {
        self.inner.list(prefix, glob)
    }

    fn compose(&self, target: &str, sources: &[String]) -> Result<()> {
        self.inner.compose(target, sources)
    }

    fn delete(&self, uri: &str) -> Result<()> {
        self.inner.delete(uri)
    }
}
