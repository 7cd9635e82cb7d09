//! Directory entries
//!
//! A directory entry describes one URL in the archive: either a content
//! entry pointing at a `(cluster, blob)` pair, or a redirect pointing at
//! another slot of the URL pointer list. The decoder dispatches on the
//! leading mimetype word: `0xFFFF` marks a redirect.
//!
//! Entries can be *bound* (carrying a non-owning handle to their archive,
//! which enables `read()`, `resolve()` and MIME lookup) or *unbound*
//! (standalone, serialization only). The bound operations live in
//! [`crate::archive`].

use byteorder::{LittleEndian, WriteBytesExt};

use crate::archive::ArchiveRef;
use crate::error::{Result, ZimError};
use crate::io::ArchiveFile;

/// Mimetype value marking redirect entries.
pub const MIMETYPE_ID_REDIRECT: u16 = 0xFFFF;

/// What an entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Content stored as blob `blob_number` of cluster `cluster_number`.
    Content {
        cluster_number: u32,
        blob_number: u32,
    },
    /// Redirect to the entry at `redirect_index` in the URL pointer list.
    Redirect { redirect_index: u32 },
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Entry {
    mimetype_id: u16,
    namespace: u8,
    revision: u32,
    kind: EntryKind,
    url: String,
    /// Title exactly as stored; empty means "same as URL".
    raw_title: String,
    /// Opaque extra bytes, preserved verbatim on rewrite.
    parameters: Vec<u8>,
    pub(crate) zim: Option<ArchiveRef>,
}

impl Entry {
    /// A new unbound content entry.
    pub fn content(
        mimetype_id: u16,
        namespace: u8,
        url: impl Into<String>,
        title: impl Into<String>,
        cluster_number: u32,
        blob_number: u32,
    ) -> Self {
        Entry {
            mimetype_id,
            namespace,
            revision: 0,
            kind: EntryKind::Content {
                cluster_number,
                blob_number,
            },
            url: url.into(),
            raw_title: title.into(),
            parameters: Vec::new(),
            zim: None,
        }
    }

    /// A new unbound redirect entry.
    pub fn redirect(
        namespace: u8,
        url: impl Into<String>,
        title: impl Into<String>,
        redirect_index: u32,
    ) -> Self {
        Entry {
            mimetype_id: MIMETYPE_ID_REDIRECT,
            namespace,
            revision: 0,
            kind: EntryKind::Redirect { redirect_index },
            url: url.into(),
            raw_title: title.into(),
            parameters: Vec::new(),
            zim: None,
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.kind, EntryKind::Redirect { .. })
    }

    pub fn mimetype_id(&self) -> u16 {
        self.mimetype_id
    }

    pub fn namespace(&self) -> u8 {
        self.namespace
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The effective title: the stored title, or the URL when the stored
    /// title is empty.
    pub fn title(&self) -> &str {
        if self.raw_title.is_empty() {
            &self.url
        } else {
            &self.raw_title
        }
    }

    /// The title exactly as stored on disk, possibly empty.
    pub fn stored_title(&self) -> &str {
        &self.raw_title
    }

    /// Namespace byte followed by the URL, no separator.
    pub fn full_url(&self) -> String {
        let mut s = String::with_capacity(self.url.len() + 1);
        s.push(self.namespace as char);
        s.push_str(&self.url);
        s
    }

    pub fn cluster_number(&self) -> Option<u32> {
        match self.kind {
            EntryKind::Content { cluster_number, .. } => Some(cluster_number),
            EntryKind::Redirect { .. } => None,
        }
    }

    pub fn blob_number(&self) -> Option<u32> {
        match self.kind {
            EntryKind::Content { blob_number, .. } => Some(blob_number),
            EntryKind::Redirect { .. } => None,
        }
    }

    pub fn redirect_index(&self) -> Option<u32> {
        match self.kind {
            EntryKind::Redirect { redirect_index } => Some(redirect_index),
            EntryKind::Content { .. } => None,
        }
    }

    pub(crate) fn set_redirect_index(&mut self, index: u32) {
        self.kind = EntryKind::Redirect {
            redirect_index: index,
        };
    }

    pub fn parameters(&self) -> &[u8] {
        &self.parameters
    }

    pub fn bound(&self) -> bool {
        self.zim.is_some()
    }

    /// Key the URL pointer list is sorted by.
    pub fn url_key(&self) -> (u8, &[u8]) {
        (self.namespace, self.url.as_bytes())
    }

    /// Key the title pointer list is sorted by.
    pub fn title_key(&self) -> (u8, &[u8]) {
        (self.namespace, self.title().as_bytes())
    }

    /// Decode the entry at `offset`, dispatching on the mimetype word.
    pub fn read_from(io: &mut ArchiveFile, offset: u64) -> Result<Entry> {
        let mimetype_id = io.read_u16_at(offset)?;
        let parameter_len = io.read_u8_at(offset + 2)?;
        let namespace = io.read_u8_at(offset + 3)?;
        let revision = io.read_u32_at(offset + 4)?;
        let (kind, strings_at) = if mimetype_id == MIMETYPE_ID_REDIRECT {
            let redirect_index = io.read_u32_at(offset + 8)?;
            (EntryKind::Redirect { redirect_index }, offset + 12)
        } else {
            let cluster_number = io.read_u32_at(offset + 8)?;
            let blob_number = io.read_u32_at(offset + 12)?;
            (
                EntryKind::Content {
                    cluster_number,
                    blob_number,
                },
                offset + 16,
            )
        };
        let (url, after_url) = io.read_string_at(strings_at)?;
        let (raw_title, after_title) = io.read_string_at(after_url)?;
        let parameters = io.read_vec_at(after_title, parameter_len as usize)?;
        Ok(Entry {
            mimetype_id,
            namespace,
            revision,
            kind,
            url,
            raw_title,
            parameters,
            zim: None,
        })
    }

    /// Read only the `(namespace, url)` prefix of the entry at `offset`.
    ///
    /// Binary search probes call this instead of [`Entry::read_from`] so a
    /// probe costs a couple of small reads rather than a full decode.
    pub fn read_url_key(io: &mut ArchiveFile, offset: u64) -> Result<(u8, Vec<u8>)> {
        let mimetype_id = io.read_u16_at(offset)?;
        let namespace = io.read_u8_at(offset + 3)?;
        let url_at = if mimetype_id == MIMETYPE_ID_REDIRECT {
            offset + 12
        } else {
            offset + 16
        };
        let (url, _) = io.read_zero_terminated_at(url_at)?;
        Ok((namespace, url))
    }

    /// Read the `(namespace, title-or-url)` prefix of the entry at `offset`.
    pub fn read_title_key(io: &mut ArchiveFile, offset: u64) -> Result<(u8, Vec<u8>)> {
        let mimetype_id = io.read_u16_at(offset)?;
        let namespace = io.read_u8_at(offset + 3)?;
        let url_at = if mimetype_id == MIMETYPE_ID_REDIRECT {
            offset + 12
        } else {
            offset + 16
        };
        let (url, after_url) = io.read_zero_terminated_at(url_at)?;
        let (title, _) = io.read_zero_terminated_at(after_url)?;
        if title.is_empty() {
            Ok((namespace, url))
        } else {
            Ok((namespace, title))
        }
    }

    /// Serialize the entry for writing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.parameters.len() > u8::MAX as usize {
            return Err(ZimError::Format(format!(
                "entry parameters of {} bytes exceed the u8 length field",
                self.parameters.len()
            )));
        }
        let mut out = Vec::with_capacity(self.disk_size() as usize);
        out.write_u16::<LittleEndian>(self.mimetype_id).unwrap();
        out.push(self.parameters.len() as u8);
        out.push(self.namespace);
        out.write_u32::<LittleEndian>(self.revision).unwrap();
        match self.kind {
            EntryKind::Content {
                cluster_number,
                blob_number,
            } => {
                out.write_u32::<LittleEndian>(cluster_number).unwrap();
                out.write_u32::<LittleEndian>(blob_number).unwrap();
            }
            EntryKind::Redirect { redirect_index } => {
                out.write_u32::<LittleEndian>(redirect_index).unwrap();
            }
        }
        out.extend_from_slice(self.url.as_bytes());
        out.push(0);
        out.extend_from_slice(self.raw_title.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.parameters);
        Ok(out)
    }

    /// Exact on-disk size, so the allocator can place the entry.
    pub fn disk_size(&self) -> u64 {
        let fixed = match self.kind {
            EntryKind::Content { .. } => 16,
            EntryKind::Redirect { .. } => 12,
        };
        fixed + self.url.len() as u64 + 1 + self.raw_title.len() as u64 + 1
            + self.parameters.len() as u64
    }
}
