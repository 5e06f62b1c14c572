//! Byte sources that can be read ahead and rewound.
//!
//! Protocol detection must not consume anything the filtering layer reads afterwards,
//! so every detector marks the source, reads, and resets it.

use std::io::{self, Read};

/// A reader supporting mark/reset look-ahead
///
/// The defaults describe a source without look-ahead: `mark` is ignored and `reset`
/// fails. Implementors that buffer override all three methods.
pub trait MarkableRead: Read {
    fn mark_supported(&self) -> bool {
        false
    }

    /// Remembers the current position. Reading more than `read_limit` bytes past it
    /// may invalidate the mark.
    fn mark(&mut self, _read_limit: usize) {}

    /// Rewinds to the last mark
    fn reset(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "mark/reset not supported",
        ))
    }
}

impl<T: MarkableRead + ?Sized> MarkableRead for &mut T {
    fn mark_supported(&self) -> bool {
        (**self).mark_supported()
    }

    fn mark(&mut self, read_limit: usize) {
        (**self).mark(read_limit)
    }

    fn reset(&mut self) -> io::Result<()> {
        (**self).reset()
    }
}

/// In-memory cursors can be rewound, but have nowhere to record a mark. They only
/// support marking at the start of their data, where `reset` rewinds to position 0.
impl<T: AsRef<[u8]>> MarkableRead for io::Cursor<T> {
    fn mark_supported(&self) -> bool {
        self.position() == 0
    }

    fn mark(&mut self, _read_limit: usize) {}

    fn reset(&mut self) -> io::Result<()> {
        self.set_position(0);
        Ok(())
    }
}

/// Wraps any reader with mark/reset support
///
/// Bytes read after `mark` are retained until either `reset` replays them or more than
/// the mark's read limit has been read, at which point the mark is dropped.
///
/// ```
/// use filterd_core::peek::{MarkableRead, PeekableReader};
/// use std::io::Read;
///
/// let mut reader = PeekableReader::new(&b"GET / HTTP/1.1\r\n"[..]);
/// reader.mark(16);
/// let mut method = [0u8; 3];
/// reader.read_exact(&mut method).unwrap();
/// reader.reset().unwrap();
///
/// let mut all = String::new();
/// reader.read_to_string(&mut all).unwrap();
/// assert!(all.starts_with("GET"));
/// ```
#[derive(Debug)]
pub struct PeekableReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    marked: bool,
    mark_limit: usize,
}

impl<R: Read> PeekableReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            marked: false,
            mark_limit: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes already pulled from the inner reader but not yet returned
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Returns the inner reader. Buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_inner(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.marked {
            self.buf.clear();
            self.pos = 0;
            return self.inner.read(out);
        }

        let start = self.buf.len();
        self.buf.resize(start + out.len(), 0);
        let result = self.inner.read(&mut self.buf[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(start + n);
        let n = result?;

        out[..n].copy_from_slice(&self.buf[start..start + n]);
        self.pos = self.buf.len();

        if self.buf.len() > self.mark_limit {
            self.marked = false;
            self.buf.clear();
            self.pos = 0;
        }
        Ok(n)
    }
}

impl<R: Read> Read for PeekableReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let buffered = self.buf.len() - self.pos;
        if buffered > 0 {
            let n = buffered.min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            if !self.marked && self.pos == self.buf.len() {
                self.buf.clear();
                self.pos = 0;
            }
            return Ok(n);
        }

        self.read_inner(out)
    }
}

impl<R: Read> MarkableRead for PeekableReader<R> {
    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, read_limit: usize) {
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.marked = true;
        self.mark_limit = read_limit.max(self.buf.len());
    }

    fn reset(&mut self) -> io::Result<()> {
        if !self.marked {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resetting to invalid mark",
            ));
        }
        self.pos = 0;
        Ok(())
    }
}

/// Performs reads until `out` is full, the source reports end of stream, or a read
/// times out. A timed out read means the peer has not sent more yet, not a failure.
pub(crate) fn read_available<R: Read + ?Sized>(reader: &mut R, out: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < out.len() {
        match reader.read(&mut out[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
