//! On-disk images of the static network.
//!
//! One entry per structure under a cache directory. Entry layout:
//!
//! ```text
//! 0-3   magic b"TBNI"
//! 4-7   format version (LE u32)
//! 8-11  configuration checksum (LE u32)
//! 12-   payload (little-endian sections)
//! last4 CRC32 of the payload
//! ```
//!
//! Readers memory-map the entry and validate magic, version, both
//! checksums and the section bounds before anything is exposed; any
//! mismatch is a typed error so callers can fall back to a fresh build.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

/// Magic bytes of a network image entry.
pub const MAGIC: [u8; 4] = *b"TBNI";

/// Byte size of the fixed entry header.
pub const HEADER_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image entry `{0}` not present")]
    Missing(PathBuf),

    #[error("image i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid magic: expected TBNI")]
    InvalidMagic,

    #[error("unsupported image format: need {need}, got {got}")]
    FormatVersion { need: u32, got: u32 },

    #[error("configuration checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    ConfigChecksum { expected: u32, got: u32 },

    #[error("content checksum mismatch")]
    ContentChecksum,

    #[error("image truncated at byte {0}")]
    Truncated(usize),
}

/// Directory of named image entries.
#[derive(Debug, Clone)]
pub struct CacheArchive {
    root: PathBuf,
}

impl CacheArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, entry: &str) -> PathBuf {
        self.root.join(entry)
    }

    /// Start writing `entry`; nothing is on disk until [`ImageWriter::finish`].
    pub fn writer(
        &self,
        entry: &str,
        format_version: u32,
        config_checksum: u32,
    ) -> ImageWriter {
        ImageWriter {
            path: self.entry_path(entry),
            format_version,
            config_checksum,
            payload: Vec::new(),
        }
    }

    /// Open and fully validate `entry`.
    pub fn reader(
        &self,
        entry: &str,
        format_version: u32,
        config_checksum: u32,
    ) -> Result<ImageReader, ImageError> {
        let path = self.entry_path(entry);
        if !path.exists() {
            return Err(ImageError::Missing(path));
        }
        let file = File::open(&path)?;
        // read-only map of an immutable cache entry
        let map = unsafe { Mmap::map(&file)? };
        ImageReader::validate(map, format_version, config_checksum)
    }
}

/// Buffered little-endian section writer.
#[derive(Debug)]
pub struct ImageWriter {
    path: PathBuf,
    format_version: u32,
    config_checksum: u32,
    payload: Vec<u8>,
}

impl ImageWriter {
    pub fn write_u8(&mut self, value: u8) {
        self.payload.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_slice(&mut self, values: &[u32]) {
        self.write_u32(values.len() as u32);
        for &value in values {
            self.write_u32(value);
        }
    }

    pub fn write_u32_pairs(&mut self, pairs: &[(u32, u32)]) {
        self.write_u32(pairs.len() as u32);
        for &(a, b) in pairs {
            self.write_u32(a);
            self.write_u32(b);
        }
    }

    /// Length-prefixed list of length-prefixed u32 rows.
    pub fn write_u32_rows(&mut self, rows: &[Vec<u32>]) {
        self.write_u32(rows.len() as u32);
        for row in rows {
            self.write_u32_slice(row);
        }
    }

    /// Write header, payload and CRC32 trailer to disk.
    pub fn finish(self) -> Result<(), ImageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.payload);
        let checksum = hasher.finalize();

        let mut file = File::create(&self.path)?;
        file.write_all(&MAGIC)?;
        file.write_all(&self.format_version.to_le_bytes())?;
        file.write_all(&self.config_checksum.to_le_bytes())?;
        file.write_all(&self.payload)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Validated, memory-mapped image entry with a read cursor.
#[derive(Debug)]
pub struct ImageReader {
    map: Mmap,
    cursor: usize,
    payload_end: usize,
}

impl ImageReader {
    fn validate(map: Mmap, format_version: u32, config_checksum: u32) -> Result<Self, ImageError> {
        let bytes: &[u8] = &map;
        if bytes.len() < HEADER_SIZE + 4 {
            return Err(ImageError::Truncated(bytes.len()));
        }
        if bytes[0..4] != MAGIC {
            return Err(ImageError::InvalidMagic);
        }
        let got_version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if got_version != format_version {
            return Err(ImageError::FormatVersion {
                need: format_version,
                got: got_version,
            });
        }
        let got_config = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if got_config != config_checksum {
            return Err(ImageError::ConfigChecksum {
                expected: config_checksum,
                got: got_config,
            });
        }

        let payload_end = bytes.len() - 4;
        let stored = u32::from_le_bytes(bytes[payload_end..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[HEADER_SIZE..payload_end]);
        if hasher.finalize() != stored {
            return Err(ImageError::ContentChecksum);
        }

        Ok(Self {
            map,
            cursor: HEADER_SIZE,
            payload_end,
        })
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ImageError> {
        if self.cursor + n > self.payload_end {
            return Err(ImageError::Truncated(self.cursor));
        }
        let slice = &self.map[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ImageError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32, ImageError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u32_vec(&mut self) -> Result<Vec<u32>, ImageError> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    pub fn read_u32_pairs(&mut self) -> Result<Vec<(u32, u32)>, ImageError> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            let a = self.read_u32()?;
            let b = self.read_u32()?;
            out.push((a, b));
        }
        Ok(out)
    }

    pub fn read_u32_rows(&mut self) -> Result<Vec<Vec<u32>>, ImageError> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_u32_vec()?);
        }
        Ok(out)
    }

    /// Whether the cursor consumed the payload exactly.
    pub fn at_end(&self) -> bool {
        self.cursor == self.payload_end
    }
}

#[cfg(test)]
mod image_tests {
    use super::*;

    #[test]
    fn round_trip_preserves_sections() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CacheArchive::new(dir.path());

        let mut writer = archive.writer("entry.img", 3, 0xfeed);
        writer.write_u32(42);
        writer.write_bool(true);
        writer.write_u32_slice(&[1, 2, 3]);
        writer.write_u32_rows(&[vec![7], vec![], vec![8, 9]]);
        writer.write_f32(1.5);
        writer.finish().unwrap();

        let mut reader = archive.reader("entry.img", 3, 0xfeed).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u32_vec().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            reader.read_u32_rows().unwrap(),
            vec![vec![7], vec![], vec![8, 9]]
        );
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert!(reader.at_end());
    }

    #[test]
    fn missing_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CacheArchive::new(dir.path());
        assert!(matches!(
            archive.reader("nope.img", 1, 0),
            Err(ImageError::Missing(_))
        ));
    }

    #[test]
    fn stale_version_and_config_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CacheArchive::new(dir.path());
        let mut writer = archive.writer("entry.img", 1, 10);
        writer.write_u32(5);
        writer.finish().unwrap();

        assert!(matches!(
            archive.reader("entry.img", 2, 10),
            Err(ImageError::FormatVersion { need: 2, got: 1 })
        ));
        assert!(matches!(
            archive.reader("entry.img", 1, 11),
            Err(ImageError::ConfigChecksum { .. })
        ));
        assert!(archive.reader("entry.img", 1, 10).is_ok());
    }

    #[test]
    fn corrupted_payload_fails_the_content_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CacheArchive::new(dir.path());
        let mut writer = archive.writer("entry.img", 1, 0);
        for i in 0..1000u32 {
            writer.write_u32(i);
        }
        writer.finish().unwrap();

        // corrupt the first byte after the header
        let path = dir.path().join("entry.img");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            archive.reader("entry.img", 1, 0),
            Err(ImageError::ContentChecksum)
        ));
    }

    #[test]
    fn reads_past_the_payload_are_truncation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CacheArchive::new(dir.path());
        let mut writer = archive.writer("entry.img", 1, 0);
        writer.write_u32(1);
        writer.finish().unwrap();

        let mut reader = archive.reader("entry.img", 1, 0).unwrap();
        reader.read_u32().unwrap();
        assert!(matches!(reader.read_u32(), Err(ImageError::Truncated(_))));
    }
}
