//! Layer compression detection, compression and decompression.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tarbox_core::error::{Result, TarboxError};
use tarbox_core::CompressionAlgorithm;

/// Detect the compression of a blob from its leading magic bytes.
///
/// Returns `None` for uncompressed data.
pub fn detect(header: &[u8]) -> Option<CompressionAlgorithm> {
    const GZIP: &[u8] = &[0x1f, 0x8b];
    const BZIP2: &[u8] = b"BZh";
    const XZ: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
    const ZSTD: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

    if header.starts_with(GZIP) {
        Some(CompressionAlgorithm::Gzip)
    } else if header.starts_with(ZSTD) {
        Some(CompressionAlgorithm::Zstd)
    } else if header.starts_with(XZ) {
        Some(CompressionAlgorithm::Xz)
    } else if header.starts_with(BZIP2) {
        Some(CompressionAlgorithm::Bzip2)
    } else {
        None
    }
}

/// Detect the compression of a blob file.
pub fn detect_file(path: &Path) -> Result<Option<CompressionAlgorithm>> {
    let mut header = [0u8; 6];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(detect(&header[..filled]))
}

/// Resolve the level to use for `algorithm`, checking an explicit one.
pub fn resolve_level(algorithm: CompressionAlgorithm, level: Option<i32>) -> Result<i32> {
    match level {
        None => Ok(algorithm.default_level()),
        Some(level) if algorithm.level_range().contains(&level) => Ok(level),
        Some(level) => {
            let range = algorithm.level_range();
            Err(TarboxError::Validation(format!(
                "compression level {} is out of range for {} ({}-{})",
                level,
                algorithm,
                range.start(),
                range.end()
            )))
        }
    }
}

/// Open a blob for reading, transparently decompressing it.
pub fn open_decompressed(path: &Path) -> Result<Box<dyn Read>> {
    let algorithm = detect_file(path)?;
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match algorithm {
        None => Box::new(file),
        Some(CompressionAlgorithm::Gzip) => Box::new(flate2::read::GzDecoder::new(file)),
        Some(CompressionAlgorithm::Bzip2) => Box::new(bzip2::read::BzDecoder::new(file)),
        Some(CompressionAlgorithm::Xz) => Box::new(xz2::read::XzDecoder::new(file)),
        Some(CompressionAlgorithm::Zstd) => Box::new(zstd::stream::read::Decoder::new(file)?),
    };
    Ok(reader)
}

/// Compress `reader` into `writer` with the given algorithm and level.
pub fn compress<R: Read, W: Write>(
    reader: &mut R,
    writer: W,
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<W> {
    let writer = match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(writer, flate2::Compression::new(level as u32));
            io::copy(reader, &mut encoder)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(writer, bzip2::Compression::new(level as u32));
            io::copy(reader, &mut encoder)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(writer, level as u32);
            io::copy(reader, &mut encoder)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
            io::copy(reader, &mut encoder)?;
            encoder.finish()?
        }
    };
    Ok(writer)
}

/// Writer adapter computing the SHA-256 digest and length of what passes through.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finish hashing, returning the inner writer, `sha256:<hex>` digest and size.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
