//! Sparse-file region discovery.

use std::fs::File;

use super::header::SparseRegion;

/// Discover the data regions of an open file.
///
/// Uses `SEEK_DATA`/`SEEK_HOLE` where the filesystem supports them; on
/// any failure the whole file is reported as one dense region, which is
/// always correct, just not compact.
pub fn scan_regions(file: &File, size: u64) -> Vec<SparseRegion> {
    if size == 0 {
        return Vec::new();
    }

    #[cfg(unix)]
    {
        if let Some(regions) = scan_with_seek(file, size) {
            return regions;
        }
    }

    vec![SparseRegion {
        offset: 0,
        len: size,
    }]
}

#[cfg(unix)]
fn scan_with_seek(file: &File, size: u64) -> Option<Vec<SparseRegion>> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut regions = Vec::new();
    let mut pos: i64 = 0;

    loop {
        let data_start = unsafe { libc::lseek(fd, pos, libc::SEEK_DATA) };
        if data_start < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::ENXIO {
                // No more data past `pos`; the file ends in a hole.
                break;
            }
            // SEEK_DATA unsupported on this filesystem.
            return None;
        }
        if data_start as u64 >= size {
            break;
        }
        let hole_start = unsafe { libc::lseek(fd, data_start, libc::SEEK_HOLE) };
        if hole_start < 0 {
            return None;
        }
        let end = (hole_start as u64).min(size);
        regions.push(SparseRegion {
            offset: data_start as u64,
            len: end - data_start as u64,
        });
        if end >= size {
            break;
        }
        pos = end as i64;
    }

    Some(regions)
}
