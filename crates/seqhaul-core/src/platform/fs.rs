use std::fs::Metadata;

/// What kind of tar member a filesystem entry maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    /// Sockets and anything else tar cannot represent.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub struct MetadataSummary {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    /// Device major/minor for character and block devices.
    pub rdev_major: u32,
    pub rdev_minor: u32,
    /// 512-byte blocks actually allocated; less than `size / 512` for
    /// sparse files.
    pub blocks: u64,
}

impl MetadataSummary {
    pub fn mtime_secs(&self) -> i64 {
        self.mtime_ns.div_euclid(1_000_000_000)
    }

    /// Heuristic for sparse files: allocation falls short of length.
    pub fn looks_sparse(&self) -> bool {
        self.kind == EntryKind::Regular && self.size > 0 && self.blocks * 512 < self.size
    }
}

pub fn summarize_metadata(metadata: &Metadata) -> MetadataSummary {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::Regular
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else if file_type.is_char_device() {
            EntryKind::CharDevice
        } else if file_type.is_block_device() {
            EntryKind::BlockDevice
        } else {
            EntryKind::Unsupported
        };

        let rdev = metadata.rdev();
        MetadataSummary {
            kind,
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            device: metadata.dev(),
            inode: metadata.ino(),
            size: metadata.len(),
            rdev_major: ((rdev >> 8) & 0xfff) as u32,
            rdev_minor: ((rdev & 0xff) | ((rdev >> 12) & !0xff_u64)) as u32,
            blocks: metadata.blocks(),
        }
    }

    #[cfg(not(unix))]
    {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::Regular
        } else {
            EntryKind::Unsupported
        };
        MetadataSummary {
            kind,
            mode: if file_type.is_dir() { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            mtime_ns: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            device: 0,
            inode: 0,
            size: metadata.len(),
            rdev_major: 0,
            rdev_minor: 0,
            blocks: metadata.len().div_ceil(512),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        let summary = summarize_metadata(&meta);
        assert_eq!(summary.kind, EntryKind::Regular);
        assert_eq!(summary.size, 5);
        assert!(summary.mtime_ns > 0);
        assert!(!summary.looks_sparse());
    }

    #[test]
    fn directory_summary() {
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::symlink_metadata(dir.path()).unwrap();
        assert_eq!(summarize_metadata(&meta).kind, EntryKind::Directory);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_summary() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert_eq!(summarize_metadata(&meta).kind, EntryKind::Symlink);
    }
}
