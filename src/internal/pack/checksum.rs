//! CRC-64 (ISO polynomial) wrappers that keep a running checksum while a
//! pack stream is written or read, for trailer emission and verification.

use std::io::{self, Read, Write};

use crc::{Crc, Digest, CRC_64_GO_ISO};

/// The ISO polynomial table, shared by writers and readers.
pub static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Format a checksum the way the trailer carries it: 16 lowercase hex
/// characters, zero padded.
pub fn trailer_hex(sum: u64) -> String {
    format!("{sum:016x}")
}

/// Writer wrapper updating the checksum with every byte written through it.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    digest: Digest<'static, u64>,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC64_ISO.digest(),
        }
    }

    /// Finish the checksum and hand back the inner writer.
    pub fn into_parts(self) -> (W, u64) {
        (self.inner, self.digest.finalize())
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader wrapper updating the checksum with every byte read through it.
pub struct ChecksumReader<R: Read> {
    inner: R,
    digest: Digest<'static, u64>,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC64_ISO.digest(),
        }
    }

    /// Finish the checksum and hand back the inner reader, positioned at
    /// the first unchecked byte (the trailer).
    pub fn into_parts(self) -> (R, u64) {
        (self.inner, self.digest.finalize())
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writing and reading the same bytes produce the same checksum.
    #[test]
    fn writer_and_reader_agree() {
        let payload = b"zeta pack payload".repeat(100);

        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(&payload).unwrap();
        let (bytes, write_sum) = w.into_parts();

        let mut r = ChecksumReader::new(&bytes[..]);
        let mut read_back = Vec::new();
        r.read_to_end(&mut read_back).unwrap();
        let (_, read_sum) = r.into_parts();

        assert_eq!(read_back, payload);
        assert_eq!(write_sum, read_sum);
    }

    /// The trailer is fixed-width lowercase hex.
    #[test]
    fn trailer_is_sixteen_hex_chars() {
        assert_eq!(trailer_hex(0), "0000000000000000");
        assert_eq!(trailer_hex(u64::MAX), "ffffffffffffffff");
        let hexed = trailer_hex(CRC64_ISO.checksum(b"abc"));
        assert_eq!(hexed.len(), 16);
        assert!(hexed.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    /// Flipping one byte changes the checksum.
    #[test]
    fn corruption_changes_sum() {
        let mut payload = b"pack bytes".to_vec();
        let clean = CRC64_ISO.checksum(&payload);
        payload[3] ^= 0x40;
        assert_ne!(clean, CRC64_ISO.checksum(&payload));
    }
}
