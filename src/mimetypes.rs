//! The MIME type list
//!
//! A sequence of NUL-terminated strings ending with an empty string.
//! Directory entries reference MIME types by index into this list, so
//! index assignment is append-only: editing an archive must never renumber
//! an existing MIME type.

use crate::error::{Result, ZimError};
use crate::io::ArchiveFile;

/// Symbolic MIME type reported for redirect entries.
pub const MIMETYPE_REDIRECT: &str = "<redirect>";

/// Ordered index → MIME string table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeTypeList {
    mimetypes: Vec<String>,
}

impl MimeTypeList {
    pub fn new(mimetypes: Vec<String>) -> Self {
        MimeTypeList { mimetypes }
    }

    pub fn len(&self) -> usize {
        self.mimetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mimetypes.is_empty()
    }

    /// Read the list at `pos`, stopping at the empty terminator string.
    pub fn read_from(io: &mut ArchiveFile, pos: u64) -> Result<Self> {
        let mut mimetypes = Vec::new();
        let mut offset = pos;
        loop {
            let (s, next) = io.read_string_at(offset)?;
            if s.is_empty() {
                break;
            }
            mimetypes.push(s);
            offset = next;
        }
        Ok(MimeTypeList { mimetypes })
    }

    /// Serialize including the double-NUL terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.disk_size() as usize);
        for mt in &self.mimetypes {
            out.extend_from_slice(mt.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    /// Exact serialized size in bytes.
    pub fn disk_size(&self) -> u64 {
        let mut size = 1u64; // terminator
        for mt in &self.mimetypes {
            size += mt.len() as u64 + 1;
        }
        size
    }

    /// The MIME string for a 16-bit index.
    pub fn get(&self, i: u16) -> Result<&str> {
        self.mimetypes
            .get(i as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| {
                ZimError::Format(format!(
                    "MIME type index {} out of range {}",
                    i,
                    self.mimetypes.len()
                ))
            })
    }

    /// Index of a MIME string, if registered.
    pub fn index_of(&self, mimetype: &str) -> Option<u16> {
        self.mimetypes
            .iter()
            .position(|m| m == mimetype)
            .map(|i| i as u16)
    }

    /// Index of a MIME string, appending it when absent. Existing
    /// indices are never reassigned.
    pub fn register(&mut self, mimetype: &str) -> u16 {
        if let Some(i) = self.index_of(mimetype) {
            return i;
        }
        self.mimetypes.push(mimetype.to_string());
        (self.mimetypes.len() - 1) as u16
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.mimetypes.iter().map(|s| s.as_str())
    }
}
