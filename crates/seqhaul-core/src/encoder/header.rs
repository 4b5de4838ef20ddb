//! GNU tar member writer over raw 512-byte blocks.
//!
//! Hand-rolled because the chunks need volume-label members (`V`),
//! old-GNU sparse members (`S`), and a trimmable end-of-archive trailer,
//! none of which library writers expose. Readers only need a tar that
//! tolerates GNU extensions, which is every mainstream tar.

use std::io::{Read, Write};

use crate::error::{HaulError, Result};
use crate::platform::fs::{EntryKind, MetadataSummary};

pub const BLOCK_LEN: usize = 512;

/// One contiguous data region of a sparse file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseRegion {
    pub offset: u64,
    pub len: u64,
}

const MAGIC_OFFSET: usize = 257;
const SPARSE_OFFSET: usize = 386;
const SPARSE_INLINE_SLOTS: usize = 4;
const SPARSE_EXT_SLOTS: usize = 21;
const ISEXTENDED_OFFSET: usize = 482;
const REALSIZE_OFFSET: usize = 483;
const LONGLINK_NAME: &[u8] = b"././@LongLink";

pub struct TarWriter<'a, W: Write> {
    out: &'a mut W,
}

impl<'a, W: Write> TarWriter<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out }
    }

    /// Volume-label member: zero-size, label in the name field.
    pub fn append_label(&mut self, label: &str) -> Result<()> {
        if label.len() > 99 {
            return Err(HaulError::SnapshotFailed(format!(
                "volume label exceeds 99 bytes: {}",
                label.len()
            )));
        }
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(&mut hdr, label.as_bytes(), 0o644, 0, 0, 0, now_fallback(), b'V');
        finalize_and_write(self.out, &mut hdr)?;
        Ok(())
    }

    pub fn append_dir(&mut self, rel: &str, meta: &MetadataSummary) -> Result<()> {
        let name = format!("{}/", rel.trim_end_matches('/'));
        self.long_name_if_needed(name.as_bytes(), b'L')?;
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            truncated(name.as_bytes()),
            meta.mode & 0o7777,
            meta.uid,
            meta.gid,
            0,
            meta.mtime_secs(),
            b'5',
        );
        finalize_and_write(self.out, &mut hdr)?;
        Ok(())
    }

    pub fn append_symlink(&mut self, rel: &str, target: &str, meta: &MetadataSummary) -> Result<()> {
        self.long_name_if_needed(rel.as_bytes(), b'L')?;
        self.long_name_if_needed(target.as_bytes(), b'K')?;
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            truncated(rel.as_bytes()),
            meta.mode & 0o7777,
            meta.uid,
            meta.gid,
            0,
            meta.mtime_secs(),
            b'2',
        );
        let link = truncated(target.as_bytes());
        hdr[157..157 + link.len()].copy_from_slice(link);
        finalize_and_write(self.out, &mut hdr)?;
        Ok(())
    }

    /// Fifo and device members. `Unsupported` kinds are the caller's
    /// problem; this only handles kinds tar can express.
    pub fn append_special(&mut self, rel: &str, meta: &MetadataSummary) -> Result<()> {
        let typeflag = match meta.kind {
            EntryKind::Fifo => b'6',
            EntryKind::CharDevice => b'3',
            EntryKind::BlockDevice => b'4',
            other => {
                return Err(HaulError::SnapshotFailed(format!(
                    "not a special file kind: {other:?}"
                )))
            }
        };
        self.long_name_if_needed(rel.as_bytes(), b'L')?;
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            truncated(rel.as_bytes()),
            meta.mode & 0o7777,
            meta.uid,
            meta.gid,
            0,
            meta.mtime_secs(),
            typeflag,
        );
        octal(&mut hdr[329..337], meta.rdev_major as u64);
        octal(&mut hdr[337..345], meta.rdev_minor as u64);
        finalize_and_write(self.out, &mut hdr)?;
        Ok(())
    }

    /// Regular file member. Reads exactly `meta.size` bytes from `data`;
    /// a source that shrank mid-read is zero-padded to the header size so
    /// the stream stays well-formed.
    pub fn append_regular(
        &mut self,
        rel: &str,
        meta: &MetadataSummary,
        data: &mut dyn Read,
    ) -> Result<()> {
        self.long_name_if_needed(rel.as_bytes(), b'L')?;
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            truncated(rel.as_bytes()),
            meta.mode & 0o7777,
            meta.uid,
            meta.gid,
            meta.size,
            meta.mtime_secs(),
            b'0',
        );
        finalize_and_write(self.out, &mut hdr)?;
        self.copy_exact_padded(data, meta.size)?;
        Ok(())
    }

    /// Old-GNU sparse member: inline slots in the header, 21-slot
    /// extension blocks beyond that, data regions written back to back.
    pub fn append_sparse(
        &mut self,
        rel: &str,
        meta: &MetadataSummary,
        regions: &[SparseRegion],
        file: &mut std::fs::File,
    ) -> Result<()> {
        use std::io::{Seek, SeekFrom};

        self.long_name_if_needed(rel.as_bytes(), b'L')?;
        let stored: u64 = regions.iter().map(|r| r.len).sum();

        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            truncated(rel.as_bytes()),
            meta.mode & 0o7777,
            meta.uid,
            meta.gid,
            stored,
            meta.mtime_secs(),
            b'S',
        );
        for (slot, region) in regions.iter().take(SPARSE_INLINE_SLOTS).enumerate() {
            write_sparse_slot(&mut hdr[SPARSE_OFFSET..], slot, region);
        }
        if regions.len() > SPARSE_INLINE_SLOTS {
            hdr[ISEXTENDED_OFFSET] = 1;
        }
        octal(&mut hdr[REALSIZE_OFFSET..REALSIZE_OFFSET + 12], meta.size);
        finalize_and_write(self.out, &mut hdr)?;

        // Extension blocks for regions beyond the inline slots.
        let mut rest = &regions[regions.len().min(SPARSE_INLINE_SLOTS)..];
        while !rest.is_empty() {
            let mut ext = [0u8; BLOCK_LEN];
            let take = rest.len().min(SPARSE_EXT_SLOTS);
            for (slot, region) in rest[..take].iter().enumerate() {
                write_sparse_slot(&mut ext, slot, region);
            }
            rest = &rest[take..];
            if !rest.is_empty() {
                ext[SPARSE_EXT_SLOTS * 24] = 1;
            }
            self.out.write_all(&ext)?;
        }

        for region in regions {
            file.seek(SeekFrom::Start(region.offset))?;
            let mut taken = file.take(region.len);
            let copied = std::io::copy(&mut taken, self.out)?;
            if copied < region.len {
                write_zeros(self.out, region.len - copied)?;
            }
        }
        let pad = stored.next_multiple_of(BLOCK_LEN as u64) - stored;
        write_zeros(self.out, pad)?;
        Ok(())
    }

    /// Two zero end-of-archive blocks. Whether they survive into the chunk
    /// is the trailer gate's decision.
    pub fn finish(&mut self) -> Result<()> {
        self.out.write_all(&[0u8; BLOCK_LEN])?;
        self.out.write_all(&[0u8; BLOCK_LEN])?;
        Ok(())
    }

    fn long_name_if_needed(&mut self, name: &[u8], typeflag: u8) -> Result<()> {
        if name.len() <= 100 {
            return Ok(());
        }
        let mut payload = name.to_vec();
        payload.push(0);
        let mut hdr = [0u8; BLOCK_LEN];
        fill_common(
            &mut hdr,
            LONGLINK_NAME,
            0o644,
            0,
            0,
            payload.len() as u64,
            now_fallback(),
            typeflag,
        );
        finalize_and_write(self.out, &mut hdr)?;
        self.out.write_all(&payload)?;
        let pad = (payload.len() as u64).next_multiple_of(BLOCK_LEN as u64) - payload.len() as u64;
        write_zeros(self.out, pad)?;
        Ok(())
    }

    fn copy_exact_padded(&mut self, data: &mut dyn Read, size: u64) -> Result<()> {
        let mut taken = data.take(size);
        let copied = std::io::copy(&mut taken, self.out)?;
        if copied < size {
            write_zeros(self.out, size - copied)?;
        }
        let pad = size.next_multiple_of(BLOCK_LEN as u64) - size;
        write_zeros(self.out, pad)?;
        Ok(())
    }
}

fn write_sparse_slot(area: &mut [u8], slot: usize, region: &SparseRegion) {
    let base = slot * 24;
    octal(&mut area[base..base + 12], region.offset);
    octal(&mut area[base + 12..base + 24], region.len);
}

/// First 100 bytes of an over-long name; the real name travels in the
/// preceding `L`/`K` record.
fn truncated(name: &[u8]) -> &[u8] {
    &name[..name.len().min(100)]
}

#[allow(clippy::too_many_arguments)]
fn fill_common(
    hdr: &mut [u8; BLOCK_LEN],
    name: &[u8],
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    typeflag: u8,
) {
    hdr[..name.len()].copy_from_slice(name);
    octal(&mut hdr[100..108], mode as u64);
    octal(&mut hdr[108..116], uid as u64);
    octal(&mut hdr[116..124], gid as u64);
    numeric(&mut hdr[124..136], size);
    octal(&mut hdr[136..148], mtime.max(0) as u64);
    hdr[156] = typeflag;
    // Old-GNU magic; readers accept it for all member types used here.
    hdr[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(b"ustar  \0");
}

fn finalize_and_write<W: Write>(out: &mut W, hdr: &mut [u8; BLOCK_LEN]) -> Result<()> {
    for b in &mut hdr[148..156] {
        *b = b' ';
    }
    let sum: u32 = hdr.iter().map(|&b| b as u32).sum();
    let chk = format!("{sum:06o}\0 ");
    hdr[148..156].copy_from_slice(chk.as_bytes());
    out.write_all(hdr)?;
    Ok(())
}

/// Octal numeric field: zero-padded, NUL-terminated.
fn octal(buf: &mut [u8], value: u64) {
    let width = buf.len() - 1;
    let mut v = value;
    for i in (0..width).rev() {
        buf[i] = b'0' + ((v & 7) as u8);
        v >>= 3;
    }
    buf[width] = 0;
}

/// Size field: octal when it fits, GNU base-256 beyond 8 GiB - 1.
fn numeric(buf: &mut [u8], value: u64) {
    let octal_max = 1u64 << (3 * (buf.len() - 1) as u32);
    if value < octal_max {
        octal(buf, value);
    } else {
        buf[0] = 0x80;
        let width = buf.len() - 1;
        let mut v = value;
        for i in (0..width).rev() {
            buf[1 + i] = (v & 0xff) as u8;
            v >>= 8;
        }
    }
}

fn write_zeros<W: Write>(out: &mut W, mut count: u64) -> Result<()> {
    let zeros = [0u8; BLOCK_LEN];
    while count > 0 {
        let n = count.min(BLOCK_LEN as u64) as usize;
        out.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(())
}

fn now_fallback() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_field_layout() {
        let mut buf = [0u8; 12];
        octal(&mut buf, 0o644);
        assert_eq!(&buf[..], b"00000000644\0");
    }

    #[test]
    fn numeric_switches_to_base256() {
        let mut buf = [0u8; 12];
        numeric(&mut buf, 1024);
        assert_eq!(&buf[..], b"00000002000\0");

        let big = 9 * 1024 * 1024 * 1024u64; // over the 8 GiB octal ceiling
        numeric(&mut buf, big);
        assert_eq!(buf[0], 0x80);
        let mut decoded: u64 = 0;
        for &b in &buf[1..] {
            decoded = (decoded << 8) | b as u64;
        }
        assert_eq!(decoded, big);
    }

    #[test]
    fn header_checksum_verifies() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        let mut data: &[u8] = b"hello";
        let meta = MetadataSummary {
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            mtime_ns: 1_700_000_000_000_000_000,
            device: 1,
            inode: 1,
            size: 5,
            rdev_major: 0,
            rdev_minor: 0,
            blocks: 1,
        };
        w.append_regular("hello.txt", &meta, &mut data).unwrap();

        let hdr = &out[..BLOCK_LEN];
        let mut sum: u32 = 0;
        for (i, &b) in hdr.iter().enumerate() {
            sum += if (148..156).contains(&i) { 32 } else { b as u32 };
        }
        let stored = std::str::from_utf8(&hdr[148..154]).unwrap();
        assert_eq!(u32::from_str_radix(stored, 8).unwrap(), sum);
        // Payload padded to one block after the header.
        assert_eq!(out.len(), 2 * BLOCK_LEN);
        assert_eq!(&out[BLOCK_LEN..BLOCK_LEN + 5], b"hello");
    }

    #[test]
    fn long_names_use_longlink_record() {
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        let long = "d/".repeat(70) + "leaf.bin";
        let meta = MetadataSummary {
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
            device: 0,
            inode: 0,
            size: 0,
            rdev_major: 0,
            rdev_minor: 0,
            blocks: 0,
        };
        let mut data: &[u8] = b"";
        w.append_regular(&long, &meta, &mut data).unwrap();
        assert_eq!(&out[..13], LONGLINK_NAME);
        assert_eq!(out[156], b'L');
    }

    #[test]
    fn sparse_header_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.bin");
        std::fs::write(&path, vec![7u8; 2048]).unwrap();
        let mut file = std::fs::File::open(&path).unwrap();

        let meta = MetadataSummary {
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
            device: 0,
            inode: 0,
            size: 1 << 20,
            rdev_major: 0,
            rdev_minor: 0,
            blocks: 4,
        };
        let regions = [
            SparseRegion { offset: 0, len: 512 },
            SparseRegion {
                offset: 1 << 19,
                len: 1024,
            },
        ];
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.append_sparse("sparse.bin", &meta, &regions, &mut file)
            .unwrap();

        let hdr = &out[..BLOCK_LEN];
        assert_eq!(hdr[156], b'S');
        assert_eq!(hdr[ISEXTENDED_OFFSET], 0);
        // realsize carries the logical length.
        let realsize = std::str::from_utf8(&hdr[REALSIZE_OFFSET..REALSIZE_OFFSET + 11]).unwrap();
        assert_eq!(u64::from_str_radix(realsize, 8).unwrap(), 1 << 20);
        // Stored size is the sum of region lengths.
        let size = std::str::from_utf8(&hdr[124..135]).unwrap();
        assert_eq!(u64::from_str_radix(size, 8).unwrap(), 1536);
        // Header + 1536 data bytes padded to block boundary.
        assert_eq!(out.len(), BLOCK_LEN + 1536);
    }

    #[test]
    fn many_sparse_regions_spill_into_extension_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holes.bin");
        std::fs::write(&path, vec![1u8; 64]).unwrap();
        let mut file = std::fs::File::open(&path).unwrap();

        let meta = MetadataSummary {
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
            device: 0,
            inode: 0,
            size: 6 * 4096,
            rdev_major: 0,
            rdev_minor: 0,
            blocks: 1,
        };
        let regions: Vec<SparseRegion> = (0..6)
            .map(|i| SparseRegion {
                offset: i * 4096,
                len: 8,
            })
            .collect();
        let mut out = Vec::new();
        let mut w = TarWriter::new(&mut out);
        w.append_sparse("holes.bin", &meta, &regions, &mut file)
            .unwrap();

        assert_eq!(out[ISEXTENDED_OFFSET], 1);
        // One extension block follows the header, then one data block.
        assert_eq!(out.len(), 3 * BLOCK_LEN);
        assert_eq!(out[BLOCK_LEN + SPARSE_EXT_SLOTS * 24], 0);
    }
}
