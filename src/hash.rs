//! Content hashing for the factory-image whitelist.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};

/// A `Read` adapter that MD5-accumulates everything read through it.
pub struct HashReader<R> {
    inner: R,
    ctx: md5::Context,
}

impl<R: Read> HashReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ctx: md5::Context::new(),
        }
    }

    /// Hex digest of all bytes read so far.
    pub fn digest(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.ctx.consume(&buf[..n]);
        Ok(n)
    }
}

/// MD5 digest of a whole file, as a lower-case hex string.
pub fn md5_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = HashReader::new(file);
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.digest())
}

#[test]
fn test_hash_reader() {
    let mut reader = HashReader::new(&b"abc"[..]);
    let mut out = Vec::new();
    io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, b"abc");
    assert_eq!(reader.digest(), "900150983cd24fb0d6963f7d28e17f72");
}

#[test]
fn test_md5_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.bin");
    std::fs::write(&path, b"abc").unwrap();
    assert_eq!(md5_file(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
}
