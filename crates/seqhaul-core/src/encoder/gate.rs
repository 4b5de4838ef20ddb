//! Byte filter that withholds the tar end-of-archive trailer.
//!
//! Every chunk's tar stream ends with two 512-byte zero blocks. For all
//! chunks except the final one those blocks must not reach the gzip
//! stream, so that the byte concatenation of chunks is a single tar whose
//! only trailer comes from the final chunk.

use std::io::{self, Write};

/// Number of trailing bytes held back: two tar blocks.
const HOLD: usize = 1024;

pub struct TrailerGate<W: Write> {
    inner: W,
    tail: Vec<u8>,
}

impl<W: Write> TrailerGate<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            tail: Vec::with_capacity(2 * HOLD),
        }
    }

    /// Flush held bytes (final chunk) or drop them (intermediate chunk)
    /// and hand back the inner writer.
    pub fn finish(mut self, keep_trailer: bool) -> io::Result<W> {
        if keep_trailer {
            self.inner.write_all(&self.tail)?;
        } else {
            debug_assert!(
                self.tail.iter().all(|&b| b == 0),
                "trimmed trailer was not all zeros"
            );
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for TrailerGate<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tail.extend_from_slice(buf);
        if self.tail.len() > HOLD {
            let release = self.tail.len() - HOLD;
            self.inner.write_all(&self.tail[..release])?;
            self.tail.drain(..release);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
