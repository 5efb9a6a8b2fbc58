//! Save options and their validation.
//!
//! `SaveFlags` is the raw flag state collected by the command line;
//! [`SaveFlags::validate`] turns it into the [`SaveOptions`] handed to an
//! [`ImageEngine`](crate::engine::ImageEngine).

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TarboxError};

/// Archive encoding produced by `save`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// OCI image layout packed into a single tar file
    OciArchive,
    /// OCI image layout written to a directory
    OciDir,
    /// Docker v2s2 archive (`docker save` compatible)
    #[default]
    DockerArchive,
    /// Docker v2s2 manifest, config and layers written to a directory
    DockerDir,
}

impl ArchiveFormat {
    /// All recognized formats, in the order they are listed to users.
    pub const ALL: [ArchiveFormat; 4] = [
        ArchiveFormat::OciArchive,
        ArchiveFormat::OciDir,
        ArchiveFormat::DockerArchive,
        ArchiveFormat::DockerDir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OciArchive => "oci-archive",
            Self::OciDir => "oci-dir",
            Self::DockerArchive => "docker-archive",
            Self::DockerDir => "docker-dir",
        }
    }

    /// Whether the format writes a directory rather than a single file.
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::OciDir | Self::DockerDir)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = TarboxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|f| f.as_str()).collect();
                TarboxError::Validation(format!(
                    "format value must be one of {}",
                    valid.join(" ")
                ))
            })
    }
}

/// Layer compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Bzip2,
    Gzip,
    Xz,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bzip2 => "bzip2",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Levels accepted by the algorithm's encoder.
    pub fn level_range(&self) -> RangeInclusive<i32> {
        match self {
            Self::Bzip2 => 1..=9,
            Self::Gzip | Self::Xz => 0..=9,
            Self::Zstd => 1..=22,
        }
    }

    /// Level used when none was requested.
    pub fn default_level(&self) -> i32 {
        match self {
            Self::Bzip2 => 9,
            Self::Gzip => 6,
            Self::Xz => 6,
            Self::Zstd => 3,
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = TarboxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bzip2" => Ok(Self::Bzip2),
            "gzip" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "zstd" => Ok(Self::Zstd),
            _ => Err(TarboxError::Validation(format!(
                "invalid compression algorithm: {s}"
            ))),
        }
    }
}

/// Raw flag state for a `save` invocation, before validation.
#[derive(Debug, Clone, Default)]
pub struct SaveFlags {
    pub format: String,
    pub output: String,
    pub compress: bool,
    pub compression_alg: Option<String>,
    pub compression_level: Option<i32>,
    pub quiet: bool,
    pub multi_image_archive: bool,
}

impl SaveFlags {
    /// Check flag combinations and resolve names to typed values.
    ///
    /// Performs no I/O. The output path is carried through untouched;
    /// resolving it is the caller's job.
    pub fn validate(self) -> Result<SaveOptions> {
        let format: ArchiveFormat = self.format.parse()?;

        if self.compress && !format.is_directory() {
            return Err(TarboxError::Validation(
                "--compress can only be set when --format is either 'oci-dir' or 'docker-dir'"
                    .to_string(),
            ));
        }

        let compression_algorithm = self
            .compression_alg
            .as_deref()
            .map(str::parse::<CompressionAlgorithm>)
            .transpose()?;

        Ok(SaveOptions {
            format,
            output: self.output,
            compress: self.compress,
            compression_algorithm,
            compression_level: self.compression_level,
            quiet: self.quiet,
            multi_image_archive: self.multi_image_archive,
        })
    }
}

/// Validated configuration for a single export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Archive encoding
    pub format: ArchiveFormat,
    /// Destination path; empty until the output has been resolved
    pub output: String,
    /// Compress uncompressed layers (directory formats only)
    pub compress: bool,
    /// Algorithm for layer compression
    pub compression_algorithm: Option<CompressionAlgorithm>,
    /// Algorithm specific level
    pub compression_level: Option<i32>,
    /// Suppress progress output
    pub quiet: bool,
    /// Interpret extra arguments as images (docker-archive only)
    pub multi_image_archive: bool,
}

impl SaveOptions {
    /// Algorithm applied when compressing layers, gzip unless chosen.
    pub fn effective_algorithm(&self) -> CompressionAlgorithm {
        self.compression_algorithm
            .unwrap_or(CompressionAlgorithm::Gzip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(format: &str) -> SaveFlags {
        SaveFlags {
            format: format.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_round_trip_names() {
        for format in ArchiveFormat::ALL {
            assert_eq!(format.as_str().parse::<ArchiveFormat>().unwrap(), format);
        }
        assert_eq!(ArchiveFormat::default(), ArchiveFormat::DockerArchive);
    }

    #[test]
    fn test_unknown_format_rejected() {
        for bad in ["", "tar", "docker", "OCI-ARCHIVE", "oci_dir"] {
            let err = flags(bad).validate().unwrap_err();
            assert_eq!(
                err.to_string(),
                "format value must be one of oci-archive oci-dir docker-archive docker-dir"
            );
        }
    }

    #[test]
    fn test_directory_formats() {
        assert!(ArchiveFormat::OciDir.is_directory());
        assert!(ArchiveFormat::DockerDir.is_directory());
        assert!(!ArchiveFormat::OciArchive.is_directory());
        assert!(!ArchiveFormat::DockerArchive.is_directory());
    }

    #[test]
    fn test_compress_requires_directory_format() {
        for format in ["docker-archive", "oci-archive"] {
            let mut f = flags(format);
            f.compress = true;
            let err = f.validate().unwrap_err();
            assert!(err.to_string().contains("--compress can only be set"));
        }
    }

    #[test]
    fn test_compress_accepted_for_directory_formats() {
        for format in ["oci-dir", "docker-dir"] {
            let mut f = flags(format);
            f.compress = true;
            f.output = "myimage.tar".to_string();
            let options = f.validate().unwrap();
            assert!(options.compress);
            assert_eq!(options.output, "myimage.tar");
        }
    }

    #[test]
    fn test_compression_algorithm_resolved() {
        let mut f = flags("oci-dir");
        f.compression_alg = Some("zstd".to_string());
        let options = f.validate().unwrap();
        assert_eq!(
            options.compression_algorithm,
            Some(CompressionAlgorithm::Zstd)
        );
        assert_eq!(options.effective_algorithm(), CompressionAlgorithm::Zstd);
    }

    #[test]
    fn test_compression_algorithm_allowed_with_archive_format() {
        let mut f = flags("docker-archive");
        f.compression_alg = Some("xz".to_string());
        assert!(f.validate().is_ok());
    }

    #[test]
    fn test_invalid_compression_algorithm() {
        let mut f = flags("oci-dir");
        f.compression_alg = Some("lz4".to_string());
        let err = f.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid compression algorithm: lz4");
    }

    #[test]
    fn test_compression_level_presence_distinct_from_zero() {
        let options = flags("oci-dir").validate().unwrap();
        assert_eq!(options.compression_level, None);

        let mut f = flags("oci-dir");
        f.compression_level = Some(0);
        assert_eq!(f.validate().unwrap().compression_level, Some(0));
    }

    #[test]
    fn test_default_algorithm_is_gzip() {
        let options = flags("docker-dir").validate().unwrap();
        assert_eq!(options.effective_algorithm(), CompressionAlgorithm::Gzip);
    }

    #[test]
    fn test_level_ranges() {
        assert!(CompressionAlgorithm::Zstd.level_range().contains(&19));
        assert!(!CompressionAlgorithm::Gzip.level_range().contains(&10));
        assert!(!CompressionAlgorithm::Bzip2.level_range().contains(&0));
        for alg in [
            CompressionAlgorithm::Bzip2,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Xz,
            CompressionAlgorithm::Zstd,
        ] {
            assert!(alg.level_range().contains(&alg.default_level()));
        }
    }
}
