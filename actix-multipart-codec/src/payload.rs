use std::{
    cmp,
    io::{self, Read},
};

use actix_web::web::{Bytes, BytesMut};

use crate::error::DecodeError;

/// Size of each read from the underlying reader.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Payload buffer.
pub(crate) struct PayloadBuffer<R> {
    reader: R,
    pub(crate) buf: BytesMut,
    /// EOF flag. If true, no more payload reads will be attempted.
    pub(crate) eof: bool,
}

impl<R: Read> PayloadBuffer<R> {
    /// Constructs new payload buffer.
    pub(crate) fn new(reader: R) -> Self {
        PayloadBuffer {
            reader,
            buf: BytesMut::with_capacity(1_024), // pre-allocate 1KiB
            eof: false,
        }
    }

    /// Reads one more chunk from the reader into the buffer.
    ///
    /// Sets the EOF flag once the reader is exhausted.
    pub(crate) fn fill(&mut self) -> Result<(), DecodeError> {
        if self.eof {
            return Ok(());
        }

        let mut chunk = [0; READ_CHUNK_SIZE];

        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reads exact number of bytes.
    #[cfg(test)]
    pub(crate) fn read_exact(&mut self, size: usize) -> Option<Bytes> {
        if size <= self.buf.len() {
            Some(self.buf.split_to(size).freeze())
        } else {
            None
        }
    }

    pub(crate) fn read_max(&mut self, size: u64) -> Result<Option<Bytes>, DecodeError> {
        if !self.buf.is_empty() {
            let size = cmp::min(self.buf.len() as u64, size) as usize;
            Ok(Some(self.buf.split_to(size).freeze()))
        } else if self.eof {
            Err(DecodeError::Incomplete)
        } else {
            Ok(None)
        }
    }

    /// Reads until specified ending.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(chunk))` - `needle` is found, with chunk ending after needle
    /// - `Err(Incomplete)` - `needle` is not found and we're at EOF
    /// - `Ok(None)` - `needle` is not found otherwise
    pub(crate) fn read_until(&mut self, needle: &[u8]) -> Result<Option<Bytes>, DecodeError> {
        match memchr::memmem::find(&self.buf, needle) {
            // buffer exhausted and EOF without finding needle
            None if self.eof => Err(DecodeError::Incomplete),

            // needle not yet found
            None => Ok(None),

            // needle found, split chunk out of buf
            Some(idx) => Ok(Some(self.buf.split_to(idx + needle.len()).freeze())),
        }
    }

    /// Reads bytes until new line delimiter (`\n`, `0x0A`).
    #[inline]
    pub(crate) fn readline(&mut self) -> Result<Option<Bytes>, DecodeError> {
        self.read_until(b"\n")
    }

    /// Reads bytes until new line delimiter or until EOF.
    #[inline]
    pub(crate) fn readline_or_eof(&mut self) -> Result<Option<Bytes>, DecodeError> {
        match self.readline() {
            Err(DecodeError::Incomplete) if self.eof => Ok(Some(self.buf.split().freeze())),
            line => line,
        }
    }

    /// Reads until `needle`, pulling from the reader as often as necessary.
    pub(crate) fn read_until_filled(&mut self, needle: &[u8]) -> Result<Bytes, DecodeError> {
        loop {
            match self.read_until(needle)? {
                Some(chunk) => return Ok(chunk),
                None => self.fill()?,
            }
        }
    }

    /// Reads a full line, or whatever remains at EOF, pulling from the reader as needed.
    pub(crate) fn readline_or_eof_filled(&mut self) -> Result<Bytes, DecodeError> {
        loop {
            match self.readline_or_eof()? {
                Some(line) => return Ok(line),
                None => self.fill()?,
            }
        }
    }
}

/// Reader handing out at most `step` bytes per call.
#[cfg(test)]
pub(crate) struct Trickle<'a> {
    data: &'a [u8],
    step: usize,
}

#[cfg(test)]
impl<'a> Trickle<'a> {
    pub(crate) fn new(data: &'a [u8], step: usize) -> Self {
        Trickle { data, step }
    }
}

#[cfg(test)]
impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = cmp::min(cmp::min(self.step, buf.len()), self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn basic() {
        let mut payload = PayloadBuffer::new(&b""[..]);
        assert_eq!(payload.buf.len(), 0);
        payload.fill().unwrap();
        assert!(payload.eof);
        assert_matches!(payload.read_max(1), Err(DecodeError::Incomplete));
    }

    #[test]
    fn eof() {
        let mut payload = PayloadBuffer::new(Trickle::new(b"data", 4));

        assert_eq!(None, payload.read_max(4).unwrap());
        payload.fill().unwrap();
        assert!(!payload.eof);

        assert_eq!(Some(Bytes::from("data")), payload.read_max(4).unwrap());
        payload.fill().unwrap();
        assert!(payload.eof);

        assert_matches!(payload.read_max(1), Err(DecodeError::Incomplete));
    }

    #[test]
    fn exact() {
        let mut payload = PayloadBuffer::new(Trickle::new(b"line1line2", 10));

        assert_eq!(payload.read_exact(2), None);
        payload.fill().unwrap();

        assert_eq!(Some(Bytes::from_static(b"li")), payload.read_exact(2));
        assert_eq!(payload.buf.len(), 8);

        assert_eq!(Some(Bytes::from_static(b"ne1l")), payload.read_exact(4));
        assert_eq!(payload.buf.len(), 4);
    }

    #[test]
    fn read_until() {
        let mut payload = PayloadBuffer::new(&b"line1line2"[..]);

        assert_eq!(None, payload.read_until(b"ne").unwrap());
        payload.fill().unwrap();

        assert_eq!(
            Some(Bytes::from("line")),
            payload.read_until(b"ne").unwrap()
        );
        assert_eq!(payload.buf.len(), 6);

        assert_eq!(
            Some(Bytes::from("1line2")),
            payload.read_until(b"2").unwrap()
        );
        assert_eq!(payload.buf.len(), 0);
    }

    #[test]
    fn read_until_across_reads() {
        let mut payload = PayloadBuffer::new(Trickle::new(b"header: value\r\n\r\nbody", 1));

        let headers = payload.read_until_filled(b"\r\n\r\n").unwrap();
        assert_eq!(headers, "header: value\r\n\r\n");

        let rest = payload.readline_or_eof_filled().unwrap();
        assert_eq!(rest, "body");
    }

    #[test]
    fn missing_needle_at_eof() {
        let mut payload = PayloadBuffer::new(Trickle::new(b"no terminator", 3));
        assert_matches!(
            payload.read_until_filled(b"\r\n"),
            Err(DecodeError::Incomplete)
        );
    }
}
