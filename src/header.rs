//! ZIM archive header (first 80 bytes)
//!
//! The header carries the archive metadata and the offsets of every other
//! top-level structure: the three pointer lists, the MIME type list and
//! the checksum trailer.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{Result, ZimError};
use crate::io::ArchiveFile;

/// Magic number identifying ZIM archives.
pub const MAGIC: u32 = 72_173_914; // 0x044D495A
/// Major format version written by this crate.
pub const MAJOR_VERSION: u16 = 6;
/// Minor format version written by this crate (namespaced layout).
pub const MINOR_VERSION: u16 = 1;
/// Major versions this crate can read.
pub const COMPATIBLE_MAJOR_VERSIONS: &[u16] = &[MAJOR_VERSION];
/// Serialized header length in bytes.
pub const HEADER_LENGTH: u64 = 80;
/// Sentinel for an absent main/layout page.
pub const NO_PAGE: u32 = 0xFFFF_FFFF;
/// Length of the MD5 checksum trailer.
pub const CHECKSUM_LENGTH: u64 = 16;

/// The fixed-size archive header.
///
/// Field order matches the on-disk layout; all integers little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// Archive UUID, stored little-endian on disk.
    pub uuid: Uuid,
    pub entry_count: u32,
    pub cluster_count: u32,
    pub url_ptr_pos: u64,
    pub title_ptr_pos: u64,
    pub cluster_ptr_pos: u64,
    pub mime_list_pos: u64,
    /// Index of the main page in the URL pointer list, or [`NO_PAGE`].
    pub main_page: u32,
    /// Index of the layout page in the URL pointer list, or [`NO_PAGE`].
    pub layout_page: u32,
    pub checksum_pos: u64,
}

impl Header {
    /// A header for a fresh, empty archive.
    pub fn new() -> Self {
        Header {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            uuid: Uuid::new_v4(),
            entry_count: 0,
            cluster_count: 0,
            url_ptr_pos: HEADER_LENGTH,
            title_ptr_pos: HEADER_LENGTH,
            cluster_ptr_pos: HEADER_LENGTH,
            mime_list_pos: HEADER_LENGTH,
            main_page: NO_PAGE,
            layout_page: NO_PAGE,
            checksum_pos: HEADER_LENGTH,
        }
    }

    /// Validate magic number and version compatibility.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(ZimError::UnsupportedFormat(format!(
                "bad magic number {:#x}, expected {:#x}",
                self.magic, MAGIC
            )));
        }
        if !COMPATIBLE_MAJOR_VERSIONS.contains(&self.major_version) {
            return Err(ZimError::UnsupportedFormat(format!(
                "major version {} not supported",
                self.major_version
            )));
        }
        // Minor version 0 is the legacy no-namespace layout; rejected
        // rather than guessed at.
        if self.minor_version != MINOR_VERSION {
            return Err(ZimError::UnsupportedFormat(format!(
                "minor version {} not supported (only the namespaced layout is)",
                self.minor_version
            )));
        }
        Ok(())
    }

    pub fn has_main_page(&self) -> bool {
        self.main_page != NO_PAGE
    }

    pub fn has_layout_page(&self) -> bool {
        self.layout_page != NO_PAGE
    }

    /// Serialize to the fixed 80-byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH as usize);
        out.write_u32::<LittleEndian>(self.magic).unwrap();
        out.write_u16::<LittleEndian>(self.major_version).unwrap();
        out.write_u16::<LittleEndian>(self.minor_version).unwrap();
        out.extend_from_slice(&self.uuid.to_bytes_le());
        out.write_u32::<LittleEndian>(self.entry_count).unwrap();
        out.write_u32::<LittleEndian>(self.cluster_count).unwrap();
        out.write_u64::<LittleEndian>(self.url_ptr_pos).unwrap();
        out.write_u64::<LittleEndian>(self.title_ptr_pos).unwrap();
        out.write_u64::<LittleEndian>(self.cluster_ptr_pos).unwrap();
        out.write_u64::<LittleEndian>(self.mime_list_pos).unwrap();
        out.write_u32::<LittleEndian>(self.main_page).unwrap();
        out.write_u32::<LittleEndian>(self.layout_page).unwrap();
        out.write_u64::<LittleEndian>(self.checksum_pos).unwrap();
        debug_assert_eq!(out.len() as u64, HEADER_LENGTH);
        out
    }

    /// Parse from the fixed 80-byte layout and validate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH as usize {
            return Err(ZimError::Format(format!(
                "header needs {} bytes, got {}",
                HEADER_LENGTH,
                bytes.len()
            )));
        }
        let mut cur = Cursor::new(bytes);
        let magic = cur.read_u32::<LittleEndian>()?;
        let major_version = cur.read_u16::<LittleEndian>()?;
        let minor_version = cur.read_u16::<LittleEndian>()?;
        let mut uuid_bytes = [0u8; 16];
        std::io::Read::read_exact(&mut cur, &mut uuid_bytes)?;
        let header = Header {
            magic,
            major_version,
            minor_version,
            uuid: Uuid::from_bytes_le(uuid_bytes),
            entry_count: cur.read_u32::<LittleEndian>()?,
            cluster_count: cur.read_u32::<LittleEndian>()?,
            url_ptr_pos: cur.read_u64::<LittleEndian>()?,
            title_ptr_pos: cur.read_u64::<LittleEndian>()?,
            cluster_ptr_pos: cur.read_u64::<LittleEndian>()?,
            mime_list_pos: cur.read_u64::<LittleEndian>()?,
            main_page: cur.read_u32::<LittleEndian>()?,
            layout_page: cur.read_u32::<LittleEndian>()?,
            checksum_pos: cur.read_u64::<LittleEndian>()?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Read the header from offset 0 of the archive file.
    pub fn read_from(io: &mut ArchiveFile) -> Result<Self> {
        let bytes = io.read_vec_at(0, HEADER_LENGTH as usize)?;
        Self::from_bytes(&bytes)
    }

    /// Write the header to offset 0 of the archive file.
    pub fn write_to(&self, io: &mut ArchiveFile) -> Result<()> {
        io.write_all_at(0, &self.to_bytes())
    }

    /// Check that the structure offsets point past the header and inside
    /// the file.
    pub fn validate_offsets(&self, file_len: u64) -> Result<()> {
        for (name, pos) in [
            ("url pointer list", self.url_ptr_pos),
            ("title pointer list", self.title_ptr_pos),
            ("cluster pointer list", self.cluster_ptr_pos),
            ("mime type list", self.mime_list_pos),
        ] {
            if pos < HEADER_LENGTH || pos > file_len {
                return Err(ZimError::Format(format!(
                    "{name} position {pos} outside file of {file_len} bytes"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
