//! Opaque filehandles
//!
//! Filehandles encode the file id, its generation and the export it was
//! issued for, sealed with a short BLAKE3 checksum so that corrupted or
//! forged handles are rejected before they reach the filesystem.

use std::fmt;

use crate::error::{CommonError, CommonResult};

/// Filehandle version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileHandleVersion {
    /// Version 1: file id, generation, export id
    V1 = 1,
}

impl TryFrom<u8> for FileHandleVersion {
    type Error = CommonError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FileHandleVersion::V1),
            _ => Err(CommonError::InvalidHandle(format!(
                "unknown version: {}",
                value
            ))),
        }
    }
}

/// Opaque filehandle
///
/// Format (25 bytes):
/// - version: 1 byte
/// - file id: 8 bytes (big-endian)
/// - generation: 8 bytes (big-endian)
/// - export id: 4 bytes (big-endian)
/// - checksum: 4 bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    data: [u8; 25],
}

impl FileHandle {
    /// Handle size in bytes
    pub const SIZE: usize = 25;

    const SEALED: usize = 21;

    /// Create a new filehandle
    pub fn new(file_id: u64, generation: u64, export_id: u32) -> Self {
        let mut data = [0u8; Self::SIZE];
        data[0] = FileHandleVersion::V1 as u8;
        data[1..9].copy_from_slice(&file_id.to_be_bytes());
        data[9..17].copy_from_slice(&generation.to_be_bytes());
        data[17..21].copy_from_slice(&export_id.to_be_bytes());

        let checksum = blake3::hash(&data[..Self::SEALED]);
        data[Self::SEALED..].copy_from_slice(&checksum.as_bytes()[0..4]);

        Self { data }
    }

    /// Parse and validate a filehandle from bytes
    pub fn from_bytes(bytes: &[u8]) -> CommonResult<Self> {
        let data: [u8; Self::SIZE] = bytes.try_into().map_err(|_| {
            CommonError::InvalidHandle(format!(
                "invalid size: expected {}, got {}",
                Self::SIZE,
                bytes.len()
            ))
        })?;

        FileHandleVersion::try_from(data[0])?;

        let checksum = blake3::hash(&data[..Self::SEALED]);
        if data[Self::SEALED..] != checksum.as_bytes()[0..4] {
            return Err(CommonError::InvalidHandle("checksum mismatch".to_string()));
        }

        Ok(Self { data })
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the version
    pub fn version(&self) -> FileHandleVersion {
        // only V1 handles pass construction and parsing
        FileHandleVersion::V1
    }

    /// Get the file id
    pub fn file_id(&self) -> u64 {
        u64::from_be_bytes(self.field::<8>(1))
    }

    /// Get the generation number
    pub fn generation(&self) -> u64 {
        u64::from_be_bytes(self.field::<8>(9))
    }

    /// Get the export id
    pub fn export_id(&self) -> u32 {
        u32::from_be_bytes(self.field::<4>(17))
    }

    fn field<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[at..at + N]);
        out
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("version", &self.version())
            .field("file_id", &self.file_id())
            .field("generation", &self.generation())
            .field("export_id", &self.export_id())
            .finish()
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fh:{}", hex::encode(self.data))
    }
}
