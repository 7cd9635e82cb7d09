//! The archive handle: lookups, redirect resolution, iteration and the
//! writer/editor engine
//!
//! A [`Zim`] owns the backing file, the parsed header and MIME table,
//! the three pointer lists, both caches and the space allocator. The
//! handle is single-threaded by construction (`Rc<RefCell<_>>`, neither
//! `Send` nor `Sync`); concurrent readers open the archive again with
//! their own handle.
//!
//! Writes land blob and entry bytes immediately; the pointer lists, MIME
//! table, header and checksum form the staged journal that [`Zim::flush`]
//! writes out. Between flushes the on-disk file is not a valid archive.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::{Rc, Weak};

use md5::{Digest, Md5};
use tracing::{debug, trace, warn};

use crate::allocator::{FreeRange, SpaceAllocator};
use crate::cache::{Cache, CacheStats};
use crate::cluster::{Cluster, ClusterBuilder};
use crate::compression::CompressionRegistry;
use crate::entry::Entry;
use crate::error::{Result, ZimError};
use crate::header::{Header, CHECKSUM_LENGTH, HEADER_LENGTH, NO_PAGE};
use crate::io::{ArchiveFile, OpenMode};
use crate::mimetypes::{MimeTypeList, MIMETYPE_REDIRECT};
use crate::pointerlist::PointerList;
use crate::policy::Policy;

/// Non-owning back-reference from a bound entry to its archive.
pub(crate) type ArchiveRef = Weak<RefCell<ZimInner>>;

/// A content item to add in one call: new cluster, one blob, one entry.
#[derive(Debug, Clone)]
pub struct Item {
    pub namespace: u8,
    pub url: String,
    pub title: String,
    pub mimetype: String,
    pub content: Vec<u8>,
}

/// Which index structures still differ from their on-disk form.
#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    header: bool,
    mimetypes: bool,
    url_list: bool,
    title_list: bool,
    cluster_list: bool,
    /// Entry or cluster bytes were rewritten; forces a checksum refresh.
    content: bool,
}

impl Dirty {
    fn any(&self) -> bool {
        self.header
            || self.mimetypes
            || self.url_list
            || self.title_list
            || self.cluster_list
            || self.content
    }
}

/// Positions and sizes of the index structures as currently on disk.
#[derive(Debug, Clone, Copy)]
struct OnDiskLayout {
    url: (u64, u64),
    title: (u64, u64),
    cluster: (u64, u64),
    mime: (u64, u64),
}

pub(crate) struct ZimInner {
    io: ArchiveFile,
    writable: bool,
    closed: bool,
    policy: Policy,
    registry: CompressionRegistry,
    header: Header,
    mimetypes: MimeTypeList,
    url_pointers: PointerList<u64>,
    title_pointers: PointerList<u32>,
    cluster_pointers: PointerList<u64>,
    entry_cache: Cache<u64, Entry>,
    cluster_cache: Cache<u64, Cluster>,
    allocator: SpaceAllocator,
    on_disk: OnDiskLayout,
    dirty: Dirty,
    self_ref: ArchiveRef,
}

/// An open ZIM archive.
pub struct Zim {
    inner: Rc<RefCell<ZimInner>>,
}

impl Zim {
    /// Open an existing archive with the default policy and codecs.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Zim> {
        Self::open_with(path, mode, 0, Policy::default(), CompressionRegistry::builtin())
    }

    /// Open an archive embedded at `base_offset` inside a larger file.
    pub fn open_at<P: AsRef<Path>>(path: P, mode: OpenMode, base_offset: u64) -> Result<Zim> {
        Self::open_with(
            path,
            mode,
            base_offset,
            Policy::default(),
            CompressionRegistry::builtin(),
        )
    }

    /// Open with explicit policy and codec registry.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        base_offset: u64,
        policy: Policy,
        registry: CompressionRegistry,
    ) -> Result<Zim> {
        let mut io = ArchiveFile::open(path, mode, base_offset)?;
        debug!(path = %io.path().display(), ?mode, "opening archive");

        let header = Header::read_from(&mut io)?;
        let file_len = io.len()?;
        header.validate_offsets(file_len)?;

        if policy.verify_checksum_on_open {
            if file_len < header.checksum_pos + CHECKSUM_LENGTH {
                return Err(ZimError::ChecksumMismatch);
            }
            let computed = checksum_of(&mut io, header.checksum_pos)?;
            let stored = io.read_vec_at(header.checksum_pos, CHECKSUM_LENGTH as usize)?;
            if computed != stored.as_slice() {
                return Err(ZimError::ChecksumMismatch);
            }
        }

        let mimetypes = MimeTypeList::read_from(&mut io, header.mime_list_pos)?;
        let url_pointers = PointerList::read_from(&mut io, header.url_ptr_pos, header.entry_count)?;
        let title_pointers =
            PointerList::read_from(&mut io, header.title_ptr_pos, header.entry_count)?;
        let cluster_pointers =
            PointerList::read_from(&mut io, header.cluster_ptr_pos, header.cluster_count)?;
        debug!(
            entries = header.entry_count,
            clusters = header.cluster_count,
            "archive structures loaded"
        );

        let mime_size = if header.mime_list_pos == HEADER_LENGTH {
            policy
                .reserve_mimetype_space
                .unwrap_or(0)
                .max(mimetypes.disk_size())
        } else {
            mimetypes.disk_size()
        };
        let on_disk = OnDiskLayout {
            url: (header.url_ptr_pos, url_pointers.disk_size()),
            title: (header.title_ptr_pos, title_pointers.disk_size()),
            cluster: (header.cluster_ptr_pos, cluster_pointers.disk_size()),
            mime: (header.mime_list_pos, mime_size),
        };

        let allocator = SpaceAllocator::new(
            header.checksum_pos,
            policy.alloc_strategy,
            policy.coalesce_free_ranges,
        );
        let writable = mode == OpenMode::Update;
        Ok(Self::wrap(ZimInner {
            io,
            writable,
            closed: false,
            entry_cache: Cache::new(policy.entry_cache_capacity),
            cluster_cache: Cache::new(policy.cluster_cache_capacity),
            policy,
            registry,
            header,
            mimetypes,
            url_pointers,
            title_pointers,
            cluster_pointers,
            allocator,
            on_disk,
            dirty: Dirty::default(),
            self_ref: Weak::new(),
        }))
    }

    /// Create a new, empty, writable archive, truncating `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Zim> {
        Self::create_with(path, Policy::default(), CompressionRegistry::builtin())
    }

    /// Create with explicit policy and codec registry.
    pub fn create_with<P: AsRef<Path>>(
        path: P,
        policy: Policy,
        registry: CompressionRegistry,
    ) -> Result<Zim> {
        let mut io = ArchiveFile::create(path)?;
        debug!(path = %io.path().display(), "creating archive");

        let mut header = Header::new();
        let reserved = policy.reserve_mimetype_space.unwrap_or(0);
        header.mime_list_pos = HEADER_LENGTH;
        header.url_ptr_pos = HEADER_LENGTH;
        header.title_ptr_pos = HEADER_LENGTH;
        header.cluster_ptr_pos = HEADER_LENGTH;
        let file_end = HEADER_LENGTH + reserved.max(1);
        header.checksum_pos = file_end;
        header.write_to(&mut io)?;
        // materialize the reserved region so checksum passes can read it
        io.set_len(file_end)?;

        let mimetypes = MimeTypeList::default();
        let on_disk = OnDiskLayout {
            url: (HEADER_LENGTH, 0),
            title: (HEADER_LENGTH, 0),
            cluster: (HEADER_LENGTH, 0),
            mime: (HEADER_LENGTH, reserved.max(mimetypes.disk_size())),
        };
        let allocator = SpaceAllocator::new(
            file_end,
            policy.alloc_strategy,
            policy.coalesce_free_ranges,
        );
        let zim = Self::wrap(ZimInner {
            io,
            writable: true,
            closed: false,
            entry_cache: Cache::new(policy.entry_cache_capacity),
            cluster_cache: Cache::new(policy.cluster_cache_capacity),
            policy,
            registry,
            header,
            mimetypes,
            url_pointers: PointerList::default(),
            title_pointers: PointerList::default(),
            cluster_pointers: PointerList::default(),
            allocator,
            on_disk,
            dirty: Dirty {
                header: true,
                mimetypes: true,
                url_list: true,
                title_list: true,
                cluster_list: true,
                content: false,
            },
            self_ref: Weak::new(),
        });
        Ok(zim)
    }

    fn wrap(inner: ZimInner) -> Zim {
        let rc = Rc::new(RefCell::new(inner));
        rc.borrow_mut().self_ref = Rc::downgrade(&rc);
        Zim { inner: rc }
    }

    pub(crate) fn downgrade(&self) -> ArchiveRef {
        Rc::downgrade(&self.inner)
    }

    // ---------------- metadata and header access ----------------

    /// A copy of the current header.
    pub fn header(&self) -> Header {
        self.inner.borrow().header.clone()
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.inner.borrow().header.uuid
    }

    pub fn entry_count(&self) -> u32 {
        self.inner.borrow().url_pointers.len() as u32
    }

    pub fn cluster_count(&self) -> u32 {
        self.inner.borrow().cluster_pointers.len() as u32
    }

    pub fn mimetypes(&self) -> Vec<String> {
        self.inner
            .borrow()
            .mimetypes
            .iter()
            .map(str::to_string)
            .collect()
    }

    /// The entry the header's main-page slot points at.
    pub fn main_page_entry(&self) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let index = inner.header.main_page;
        if index == NO_PAGE {
            return Err(ZimError::NotFound("main page".to_string()));
        }
        inner.entry_by_index(index)
    }

    /// The entry the header's layout-page slot points at.
    pub fn layout_page_entry(&self) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let index = inner.header.layout_page;
        if index == NO_PAGE {
            return Err(ZimError::NotFound("layout page".to_string()));
        }
        inner.entry_by_index(index)
    }

    /// Read a metadata value from the `M` namespace, following redirects.
    pub fn metadata(&self, key: &str) -> Result<Vec<u8>> {
        let entry = self.get_entry_by_url(b'M', key)?;
        let resolved = self.resolve(&entry)?;
        resolved.read()
    }

    /// All metadata keys present in the `M` namespace.
    pub fn metadata_keys(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let start = inner.url_lower_bound(b'M', b"")?;
        let mut keys = Vec::new();
        for i in start..inner.url_pointers.len() {
            let entry = inner.entry_by_index(i as u32)?;
            if entry.namespace() != b'M' {
                break;
            }
            keys.push(entry.url().to_string());
        }
        Ok(keys)
    }

    // ---------------- lookup ----------------

    /// Find an entry by namespace and URL via binary search over the URL
    /// pointer list. Probes read only the `(namespace, url)` prefix.
    pub fn get_entry_by_url(&self, namespace: u8, url: &str) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        match inner.url_index_of(namespace, url.as_bytes())? {
            Some(i) => inner.entry_by_index(i),
            None => Err(ZimError::NotFound(format!(
                "{}{}",
                namespace as char, url
            ))),
        }
    }

    /// Find an entry by namespace and title via the title pointer list.
    pub fn get_entry_by_title(&self, namespace: u8, title: &str) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let target = title.as_bytes();
        let i = inner.title_lower_bound(namespace, target)?;
        if i < inner.title_pointers.len() {
            let url_index = inner.title_pointers.get(i)?;
            let offset = inner.url_pointers.get(url_index as usize)?;
            let key = Entry::read_title_key(&mut inner.io, offset)?;
            if key.0 == namespace && key.1 == target {
                return inner.entry_by_index(url_index);
            }
        }
        Err(ZimError::NotFound(format!(
            "title {}{}",
            namespace as char, title
        )))
    }

    /// Look up a full URL: the leading byte is the namespace, the rest
    /// the URL (`"Chello"` is `hello` in namespace `C`).
    pub fn get_entry_by_full_url(&self, full_url: &str) -> Result<Entry> {
        if full_url.is_empty() {
            return Err(ZimError::NotFound("<empty full URL>".to_string()));
        }
        let namespace = full_url.as_bytes()[0];
        self.get_entry_by_url(namespace, &full_url[1..])
    }

    /// Shorthand for a lookup in the content namespace `C`.
    pub fn get_content_entry_by_url(&self, url: &str) -> Result<Entry> {
        self.get_entry_by_url(b'C', url)
    }

    /// The entry at position `i` of the URL pointer list.
    pub fn get_entry_by_id(&self, i: u32) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        inner.entry_by_index(i)
    }

    /// Index of an entry's URL in the URL pointer list, if present.
    pub fn url_index_of(&self, namespace: u8, url: &str) -> Result<Option<u32>> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        inner.url_index_of(namespace, url.as_bytes())
    }

    /// Follow redirects from `entry` until a content entry is reached.
    pub fn resolve(&self, entry: &Entry) -> Result<Entry> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        inner.resolve(entry)
    }

    /// Read one blob by `(cluster, blob)` coordinates.
    pub fn read_blob(&self, cluster_number: u32, blob_number: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        inner.read_blob(cluster_number, blob_number)
    }

    // ---------------- iteration ----------------

    /// Iterate entries in URL order, optionally restricted to one
    /// namespace. Lazy; each advance reads one entry.
    pub fn iter_entries(&self, namespace: Option<u8>) -> Result<EntryIter> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let (start, end) = match namespace {
            None => (0, inner.url_pointers.len() as u32),
            Some(ns) => {
                let start = inner.url_lower_bound(ns, b"")? as u32;
                (start, inner.url_pointers.len() as u32)
            }
        };
        Ok(EntryIter {
            zim: Rc::clone(&self.inner),
            next: start,
            end,
            namespace,
        })
    }

    /// Iterate all clusters by number.
    pub fn iter_clusters(&self) -> Result<ClusterIter> {
        let inner = self.inner.borrow();
        Ok(ClusterIter {
            zim: Rc::clone(&self.inner),
            next: 0,
            end: inner.cluster_pointers.len() as u32,
        })
    }

    /// Iterate the blobs of one cluster in order. The cluster is pinned
    /// in the cache until the iterator is dropped.
    pub fn iter_blobs(&self, cluster_number: u32) -> Result<BlobIter> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let offset = inner.cluster_offset(cluster_number)?;
        let cluster = inner.cluster_at(offset)?;
        let count = cluster.blob_count();
        inner.cluster_cache.pin(&offset);
        Ok(BlobIter {
            zim: Rc::clone(&self.inner),
            cluster_number,
            cluster_offset: offset,
            next: 0,
            count,
        })
    }

    /// Access a cluster by number (mainly for inspection).
    pub fn get_cluster(&self, cluster_number: u32) -> Result<Rc<Cluster>> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let offset = inner.cluster_offset(cluster_number)?;
        inner.cluster_at(offset)
    }

    // ---------------- writer ----------------

    /// Serialize and append a cluster, returning its cluster number.
    pub fn add_cluster(&self, builder: &ClusterBuilder) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.add_cluster(builder)
    }

    /// Add a directory entry. `overwrite` releases an existing entry at
    /// the same full URL instead of failing with `DuplicateEntry`.
    pub fn add_entry(&self, entry: Entry, overwrite: bool) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.add_entry(entry, overwrite)
    }

    /// Remove the entry at `(namespace, url)`, releasing its bytes and,
    /// when nothing else references it, its cluster.
    pub fn remove_entry(&self, namespace: u8, url: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.remove_entry(namespace, url, true)
    }

    /// Fetch-modify-replace an entry. Same-size edits that keep the full
    /// URL are rewritten in place; anything else is a remove + add.
    pub fn edit_entry(
        &self,
        namespace: u8,
        url: &str,
        edit: impl FnOnce(&mut Entry),
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.edit_entry(namespace, url, edit)
    }

    /// Add one content item: a fresh cluster holding its bytes
    /// (compressed per policy) plus a content entry. Replaces an
    /// existing entry at the same full URL.
    pub fn add_item(&self, item: Item) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.add_item(item)
    }

    /// Add a redirect entry pointing at an existing target entry.
    pub fn add_redirect(
        &self,
        namespace: u8,
        url: &str,
        title: &str,
        target_namespace: u8,
        target_url: &str,
    ) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        if namespace == target_namespace && url == target_url {
            return Err(ZimError::Format(format!(
                "redirect {}{} points at itself",
                namespace as char, url
            )));
        }
        let target = inner
            .url_index_of(target_namespace, target_url.as_bytes())?
            .ok_or_else(|| {
                ZimError::NotFound(format!("{}{}", target_namespace as char, target_url))
            })?;
        inner.add_entry(Entry::redirect(namespace, url, title, target), false)
    }

    /// Store a metadata value under the `M` namespace.
    pub fn set_metadata(&self, key: &str, value: impl Into<Vec<u8>>, mimetype: &str) -> Result<()> {
        self.add_item(Item {
            namespace: b'M',
            url: key.to_string(),
            title: String::new(),
            mimetype: mimetype.to_string(),
            content: value.into(),
        })?;
        Ok(())
    }

    /// Point the header's main-page slot at an entry index, or clear it.
    pub fn set_main_page(&self, index: Option<u32>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        if let Some(i) = index {
            if i as usize >= inner.url_pointers.len() {
                return Err(ZimError::NotFound(format!("entry index {i}")));
            }
        }
        inner.header.main_page = index.unwrap_or(NO_PAGE);
        inner.dirty.header = true;
        Ok(())
    }

    /// Replace the archive UUID.
    pub fn set_uuid(&self, uuid: uuid::Uuid) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.header.uuid = uuid;
        inner.dirty.header = true;
        Ok(())
    }

    /// Write out pointer lists, MIME table, header and checksum. The
    /// only point where the on-disk file becomes a valid archive again.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.flush()
    }

    /// Flush pending changes (when writable) and close the handle.
    /// Dropping the handle without `close` discards unflushed edits.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Ok(());
        }
        if inner.writable && inner.dirty.any() {
            inner.flush()?;
        }
        inner.closed = true;
        debug!("archive closed");
        Ok(())
    }

    /// Rebuild the allocator from the set difference of the file and all
    /// live regions, recovering holes left by earlier sessions.
    pub fn scan_for_holes(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        inner.scan_for_holes()
    }

    /// Current free ranges, for tests and debugging.
    pub fn allocator_snapshot(&self) -> Vec<FreeRange> {
        self.inner.borrow().allocator.snapshot()
    }

    /// The checksum stored in the trailer.
    pub fn stored_checksum(&self) -> Result<[u8; 16]> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let pos = inner.header.checksum_pos;
        let bytes = inner.io.read_vec_at(pos, CHECKSUM_LENGTH as usize)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// MD5 of everything before the checksum trailer, computed now.
    pub fn compute_checksum(&self) -> Result<[u8; 16]> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        let pos = inner.header.checksum_pos;
        checksum_of(&mut inner.io, pos)
    }

    pub fn entry_cache_stats(&self) -> CacheStats {
        self.inner.borrow().entry_cache.stats()
    }

    pub fn cluster_cache_stats(&self) -> CacheStats {
        self.inner.borrow().cluster_cache.stats()
    }
}

/// MD5 over `[0, end)` of the archive.
fn checksum_of(io: &mut ArchiveFile, end: u64) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    let mut pos = 0u64;
    let mut buf = [0u8; 8192];
    while pos < end {
        let want = (end - pos).min(buf.len() as u64) as usize;
        io.read_exact_at(pos, &mut buf[..want])?;
        hasher.update(&buf[..want]);
        pos += want as u64;
    }
    Ok(hasher.finalize().into())
}

// ---------------- bound entry operations ----------------

impl Entry {
    fn archive(&self) -> Result<Rc<RefCell<ZimInner>>> {
        self.zim
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ZimError::BindRequired)
    }

    /// Bind this entry to an archive. Rebinding to the same archive is a
    /// no-op; binding to a different one is an error.
    pub fn bind(&mut self, zim: &Zim) -> Result<()> {
        if let Some(existing) = &self.zim {
            if existing.upgrade().is_some() && !Weak::ptr_eq(existing, &zim.downgrade()) {
                return Err(ZimError::BindRequired);
            }
        }
        self.zim = Some(zim.downgrade());
        Ok(())
    }

    pub fn unbind(&mut self) {
        self.zim = None;
    }

    /// Read this entry's content. Redirects are resolved first.
    pub fn read(&self) -> Result<Vec<u8>> {
        let archive = self.archive()?;
        let mut inner = archive.borrow_mut();
        inner.check_open()?;
        let resolved = inner.resolve(self)?;
        match (resolved.cluster_number(), resolved.blob_number()) {
            (Some(cluster), Some(blob)) => inner.read_blob(cluster, blob),
            _ => Err(ZimError::NotFound(format!(
                "content of {}",
                resolved.full_url()
            ))),
        }
    }

    /// Decompressed size of this entry's content.
    pub fn content_size(&self) -> Result<u64> {
        let archive = self.archive()?;
        let mut inner = archive.borrow_mut();
        inner.check_open()?;
        let resolved = inner.resolve(self)?;
        match (resolved.cluster_number(), resolved.blob_number()) {
            (Some(cluster), Some(blob)) => {
                let offset = inner.cluster_offset(cluster)?;
                let cluster = inner.cluster_at(offset)?;
                cluster.blob_size(blob)
            }
            _ => Err(ZimError::NotFound(format!(
                "content of {}",
                resolved.full_url()
            ))),
        }
    }

    /// Follow redirects until a content entry is reached.
    pub fn resolve(&self) -> Result<Entry> {
        let archive = self.archive()?;
        let mut inner = archive.borrow_mut();
        inner.check_open()?;
        inner.resolve(self)
    }

    /// The MIME type string of this entry; redirects report the symbolic
    /// redirect MIME type.
    pub fn mimetype(&self) -> Result<String> {
        if self.is_redirect() {
            return Ok(MIMETYPE_REDIRECT.to_string());
        }
        let archive = self.archive()?;
        let inner = archive.borrow();
        Ok(inner.mimetypes.get(self.mimetype_id())?.to_string())
    }
}

// ---------------- iterators ----------------

/// Lazy entry iterator in URL order; see [`Zim::iter_entries`].
pub struct EntryIter {
    zim: Rc<RefCell<ZimInner>>,
    next: u32,
    end: u32,
    namespace: Option<u8>,
}

impl Iterator for EntryIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let i = self.next;
        self.next += 1;
        let mut inner = self.zim.borrow_mut();
        match inner.entry_by_index(i) {
            Ok(entry) => {
                if let Some(ns) = self.namespace {
                    if entry.namespace() != ns {
                        self.next = self.end;
                        return None;
                    }
                }
                Some(Ok(entry))
            }
            Err(e) => {
                self.next = self.end;
                Some(Err(e))
            }
        }
    }
}

/// Lazy cluster iterator; see [`Zim::iter_clusters`].
pub struct ClusterIter {
    zim: Rc<RefCell<ZimInner>>,
    next: u32,
    end: u32,
}

impl Iterator for ClusterIter {
    type Item = Result<Rc<Cluster>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let i = self.next;
        self.next += 1;
        let mut inner = self.zim.borrow_mut();
        let item = inner
            .cluster_offset(i)
            .and_then(|offset| inner.cluster_at(offset));
        if item.is_err() {
            self.next = self.end;
        }
        Some(item)
    }
}

/// Blob iterator over one cluster; holds a pin on the cached cluster so
/// a sequential scan cannot evict its own working set.
pub struct BlobIter {
    zim: Rc<RefCell<ZimInner>>,
    cluster_number: u32,
    cluster_offset: u64,
    next: u32,
    count: u32,
}

impl BlobIter {
    pub fn cluster_number(&self) -> u32 {
        self.cluster_number
    }
}

impl Iterator for BlobIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let i = self.next;
        self.next += 1;
        let mut inner = self.zim.borrow_mut();
        let item = inner.read_blob(self.cluster_number, i);
        if item.is_err() {
            self.next = self.count;
        }
        Some(item)
    }
}

impl Drop for BlobIter {
    fn drop(&mut self) {
        self.zim
            .borrow_mut()
            .cluster_cache
            .unpin(&self.cluster_offset);
    }
}

// ---------------- internals ----------------

impl ZimInner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ZimError::ArchiveClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(ZimError::ReadOnly);
        }
        Ok(())
    }

    /// Read (or fetch from cache) the entry at a file offset, bound to
    /// this archive.
    fn entry_at(&mut self, offset: u64) -> Result<Entry> {
        if let Some(cached) = self.entry_cache.get(&offset) {
            trace!(offset, "entry cache hit");
            return Ok((*cached).clone());
        }
        let mut entry = Entry::read_from(&mut self.io, offset)?;
        entry.zim = Some(self.self_ref.clone());
        self.entry_cache.put(offset, entry.clone());
        Ok(entry)
    }

    fn entry_by_index(&mut self, i: u32) -> Result<Entry> {
        let offset = self
            .url_pointers
            .get(i as usize)
            .map_err(|_| ZimError::NotFound(format!("entry index {i}")))?;
        self.entry_at(offset)
    }

    /// First URL-pointer index whose `(namespace, url)` key is `>=` the
    /// target. Each probe reads only the key prefix of one entry.
    fn url_lower_bound(&mut self, namespace: u8, url: &[u8]) -> Result<usize> {
        let ZimInner {
            io, url_pointers, ..
        } = self;
        url_pointers.lower_bound(|offset| {
            let (ns, key_url) = Entry::read_url_key(io, offset)?;
            Ok((ns, key_url.as_slice()) < (namespace, url))
        })
    }

    fn url_index_of(&mut self, namespace: u8, url: &[u8]) -> Result<Option<u32>> {
        let i = self.url_lower_bound(namespace, url)?;
        if i < self.url_pointers.len() {
            let offset = self.url_pointers.get(i)?;
            let (ns, key_url) = Entry::read_url_key(&mut self.io, offset)?;
            if ns == namespace && key_url == url {
                return Ok(Some(i as u32));
            }
        }
        Ok(None)
    }

    /// First title-pointer index whose `(namespace, title)` key is `>=`
    /// the target. Probes dereference through the URL pointer list.
    fn title_lower_bound(&mut self, namespace: u8, title: &[u8]) -> Result<usize> {
        let ZimInner {
            io,
            url_pointers,
            title_pointers,
            ..
        } = self;
        title_pointers.lower_bound(|url_index| {
            let offset = url_pointers.get(url_index as usize)?;
            let (ns, key_title) = Entry::read_title_key(io, offset)?;
            Ok((ns, key_title.as_slice()) < (namespace, title))
        })
    }

    fn resolve(&mut self, entry: &Entry) -> Result<Entry> {
        let max_depth = self.policy.redirect_max_depth;
        let mut visited: HashSet<u32> = HashSet::new();
        let mut current = entry.clone();
        let mut depth = 0u32;
        while let Some(index) = current.redirect_index() {
            if !visited.insert(index) {
                return Err(ZimError::RedirectLoop);
            }
            depth += 1;
            if depth > max_depth {
                return Err(ZimError::RedirectTooDeep(max_depth));
            }
            current = self.entry_by_index(index)?;
        }
        Ok(current)
    }

    fn cluster_offset(&self, cluster_number: u32) -> Result<u64> {
        self.cluster_pointers
            .get(cluster_number as usize)
            .map_err(|_| ZimError::NotFound(format!("cluster {cluster_number}")))
    }

    fn cluster_at(&mut self, offset: u64) -> Result<Rc<Cluster>> {
        if let Some(cached) = self.cluster_cache.get(&offset) {
            trace!(offset, "cluster cache hit");
            return Ok(cached);
        }
        let cluster = Cluster::read_from(
            &mut self.io,
            &self.registry,
            offset,
            self.policy.cluster_representation,
        )?;
        Ok(self.cluster_cache.put(offset, cluster))
    }

    fn read_blob(&mut self, cluster_number: u32, blob_number: u32) -> Result<Vec<u8>> {
        let offset = self.cluster_offset(cluster_number)?;
        let cluster = self.cluster_at(offset)?;
        let ZimInner { io, registry, .. } = self;
        cluster.read_blob(io, registry, blob_number)
    }

    // ---------------- writer internals ----------------

    /// Allocate and write a byte run, releasing the reservation on any
    /// write failure so no range is left dangling.
    fn write_allocated(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.allocator.allocate(bytes.len() as u64);
        if let Err(e) = self.io.write_all_at(offset, bytes) {
            self.allocator.release(offset, bytes.len() as u64);
            return Err(e);
        }
        self.dirty.content = true;
        Ok(offset)
    }

    fn add_cluster(&mut self, builder: &ClusterBuilder) -> Result<u32> {
        let bytes = builder.serialize(&self.registry)?;
        let offset = self.write_allocated(&bytes)?;
        self.cluster_cache.invalidate(&offset);
        self.cluster_pointers.push(offset);
        self.dirty.cluster_list = true;
        self.dirty.header = true;
        let number = (self.cluster_pointers.len() - 1) as u32;
        trace!(number, offset, size = bytes.len(), "cluster written");
        Ok(number)
    }

    fn add_entry(&mut self, mut entry: Entry, overwrite: bool) -> Result<u32> {
        let mut restore_main = false;
        let mut restore_layout = false;
        if let Some(existing) = self.url_index_of(entry.namespace(), entry.url().as_bytes())? {
            if !overwrite {
                return Err(ZimError::DuplicateEntry(entry.full_url()));
            }
            // The replacement may reference the same cluster, so only the
            // old entry's bytes and pointers are released here.
            let keep_cluster = {
                let old = self.entry_by_index(existing)?;
                old.cluster_number() == entry.cluster_number()
            };
            restore_main = self.header.has_main_page() && self.header.main_page == existing;
            restore_layout = self.header.has_layout_page() && self.header.layout_page == existing;
            self.remove_entry(entry.namespace(), &entry.url().to_string(), !keep_cluster)?;
        }

        entry.zim = Some(self.self_ref.clone());
        let bytes = entry.to_bytes()?;
        let offset = self.write_allocated(&bytes)?;
        self.entry_cache.invalidate(&offset);

        let insert_at = self.url_lower_bound(entry.namespace(), entry.url().as_bytes())?;
        self.url_pointers.insert(insert_at, offset);
        let insert_at = insert_at as u32;
        // every reference to a URL index at or past the insertion point
        // shifts by one
        self.title_pointers.mass_update(insert_at, 1);
        self.shift_redirect_indices(insert_at, 1)?;
        if self.header.has_main_page() && self.header.main_page >= insert_at {
            self.header.main_page += 1;
        }
        if self.header.has_layout_page() && self.header.layout_page >= insert_at {
            self.header.layout_page += 1;
        }

        let title_at = self.title_lower_bound(entry.namespace(), entry.title().as_bytes())?;
        self.title_pointers.insert(title_at, insert_at);

        // a replaced entry keeps its main/layout page role
        if restore_main {
            self.header.main_page = insert_at;
        }
        if restore_layout {
            self.header.layout_page = insert_at;
        }

        self.entry_cache.put(offset, entry.clone());
        self.dirty.url_list = true;
        self.dirty.title_list = true;
        self.dirty.header = true;
        trace!(url = %entry.full_url(), index = insert_at, offset, "entry written");
        Ok(insert_at)
    }

    fn remove_entry(&mut self, namespace: u8, url: &str, release_cluster: bool) -> Result<()> {
        let index = self
            .url_index_of(namespace, url.as_bytes())?
            .ok_or_else(|| ZimError::NotFound(format!("{}{}", namespace as char, url)))?;
        let offset = self.url_pointers.get(index as usize)?;
        let entry = self.entry_at(offset)?;
        let entry_size = entry.disk_size();
        trace!(url = %entry.full_url(), index, offset, "removing entry");

        match self.title_pointers.position_of(index) {
            Some(i) => {
                self.title_pointers.remove(i);
            }
            None => warn!(index, "entry missing from title pointer list"),
        }
        self.url_pointers.remove(index as usize);
        // references past the removed slot shift down; references to the
        // slot itself are dangling and flagged by shift_redirect_indices
        self.title_pointers.mass_update(index + 1, -1);
        self.shift_redirect_indices(index + 1, -1)?;
        if self.header.has_main_page() {
            if self.header.main_page == index {
                self.header.main_page = NO_PAGE;
            } else if self.header.main_page > index {
                self.header.main_page -= 1;
            }
        }
        if self.header.has_layout_page() {
            if self.header.layout_page == index {
                self.header.layout_page = NO_PAGE;
            } else if self.header.layout_page > index {
                self.header.layout_page -= 1;
            }
        }

        self.entry_cache.invalidate(&offset);
        self.allocator.release(offset, entry_size);

        if release_cluster {
            if let Some(cluster_number) = entry.cluster_number() {
                if !self.cluster_is_referenced(cluster_number)? {
                    self.remove_cluster(cluster_number)?;
                }
            }
        }

        self.dirty.url_list = true;
        self.dirty.title_list = true;
        self.dirty.header = true;
        Ok(())
    }

    fn edit_entry(
        &mut self,
        namespace: u8,
        url: &str,
        edit: impl FnOnce(&mut Entry),
    ) -> Result<()> {
        let index = self
            .url_index_of(namespace, url.as_bytes())?
            .ok_or_else(|| ZimError::NotFound(format!("{}{}", namespace as char, url)))?;
        let offset = self.url_pointers.get(index as usize)?;
        let old = self.entry_at(offset)?;
        let old_size = old.disk_size();
        let old_title = old.title().to_string();
        let old_cluster = old.cluster_number();

        let mut entry = old;
        edit(&mut entry);

        let url_changed = entry.namespace() != namespace || entry.url() != url;
        if url_changed
            && self
                .url_index_of(entry.namespace(), entry.url().as_bytes())?
                .is_some()
        {
            return Err(ZimError::DuplicateEntry(entry.full_url()));
        }

        let same_slot = !url_changed && entry.disk_size() == old_size;
        if same_slot {
            // in-place rewrite, pointer positions preserved
            entry.zim = Some(self.self_ref.clone());
            let bytes = entry.to_bytes()?;
            self.io.write_all_at(offset, &bytes)?;
            self.dirty.content = true;
            self.entry_cache.invalidate(&offset);
            self.entry_cache.put(offset, entry.clone());
            if entry.title() != old_title {
                if let Some(i) = self.title_pointers.position_of(index) {
                    self.title_pointers.remove(i);
                    let at = self.title_lower_bound(entry.namespace(), entry.title().as_bytes())?;
                    self.title_pointers.insert(at, index);
                    self.dirty.title_list = true;
                }
            }
            // an edit that re-points the entry elsewhere may orphan the
            // old cluster
            if entry.cluster_number() != old_cluster {
                if let Some(cluster) = old_cluster {
                    if !self.cluster_is_referenced(cluster)? {
                        self.remove_cluster(cluster)?;
                    }
                }
            }
            return Ok(());
        }

        let release_cluster = entry.cluster_number() != old_cluster;
        let was_main = self.header.has_main_page() && self.header.main_page == index;
        let was_layout = self.header.has_layout_page() && self.header.layout_page == index;
        self.remove_entry(namespace, url, release_cluster)?;
        let new_index = self.add_entry(entry, false)?;
        if was_main {
            self.header.main_page = new_index;
        }
        if was_layout {
            self.header.layout_page = new_index;
        }
        Ok(())
    }

    fn add_item(&mut self, item: Item) -> Result<u32> {
        let mimetype_id = self.mimetypes.register(&item.mimetype);
        self.dirty.mimetypes = true;
        let mut builder = ClusterBuilder::new(self.policy.compression);
        let blob = builder.push_blob(item.content);
        let cluster_number = self.add_cluster(&builder)?;
        let entry = Entry::content(
            mimetype_id,
            item.namespace,
            item.url,
            item.title,
            cluster_number,
            blob,
        );
        self.add_entry(entry, true)
    }

    /// Rewrite every redirect whose target index is `>= start` to point
    /// `diff` slots over. Entries are rewritten in place (the index is a
    /// fixed-width field) and the cache refreshed.
    fn shift_redirect_indices(&mut self, start: u32, diff: i64) -> Result<()> {
        for i in 0..self.url_pointers.len() {
            let offset = self.url_pointers.get(i)?;
            let entry = self.entry_at(offset)?;
            let Some(target) = entry.redirect_index() else {
                continue;
            };
            if diff < 0 && target == start - 1 {
                warn!(url = %entry.full_url(), "redirect target was removed, leaving it dangling");
                continue;
            }
            if target >= start {
                let mut updated = entry.clone();
                updated.set_redirect_index((target as i64 + diff) as u32);
                let bytes = updated.to_bytes()?;
                self.io.write_all_at(offset, &bytes)?;
                self.dirty.content = true;
                self.entry_cache.invalidate(&offset);
                self.entry_cache.put(offset, updated);
            }
        }
        Ok(())
    }

    /// Does any entry still reference this cluster?
    fn cluster_is_referenced(&mut self, cluster_number: u32) -> Result<bool> {
        for i in 0..self.url_pointers.len() {
            let offset = self.url_pointers.get(i)?;
            let entry = self.entry_at(offset)?;
            if entry.cluster_number() == Some(cluster_number) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Release an unreferenced cluster. The last pointer is popped; a
    /// middle pointer is aliased to the last cluster's offset so every
    /// other cluster keeps its number.
    fn remove_cluster(&mut self, cluster_number: u32) -> Result<()> {
        let offset = self.cluster_offset(cluster_number)?;
        let size = self.cluster_extent(offset)?;
        trace!(cluster_number, offset, size, "releasing cluster");
        self.cluster_cache.invalidate(&offset);
        self.allocator.release(offset, size);
        let last = self.cluster_pointers.len() - 1;
        if cluster_number as usize == last {
            self.cluster_pointers.remove(last);
        } else {
            let placeholder = self.cluster_pointers.get(last)?;
            self.cluster_pointers.set(cluster_number as usize, placeholder);
        }
        self.dirty.cluster_list = true;
        self.dirty.header = true;
        Ok(())
    }

    /// Size of the cluster allocation starting at `offset`: the gap to
    /// the next live structure, free range or the file end. Compressed
    /// clusters do not record their own length, but in a coherent file
    /// every byte belongs to some structure, so the gap is exact.
    fn cluster_extent(&mut self, offset: u64) -> Result<u64> {
        let mut next = self.allocator.file_end();
        let mut consider = |candidate: u64| {
            if candidate > offset && candidate < next {
                next = candidate;
            }
        };
        for p in self.url_pointers.iter() {
            consider(p);
        }
        for p in self.cluster_pointers.iter() {
            consider(p);
        }
        consider(self.on_disk.url.0);
        consider(self.on_disk.title.0);
        consider(self.on_disk.cluster.0);
        consider(self.on_disk.mime.0);
        for range in self.allocator.snapshot() {
            consider(range.start);
        }
        Ok(next.saturating_sub(offset))
    }

    /// All byte regions occupied by live structures.
    fn live_regions(&mut self) -> Result<Vec<FreeRange>> {
        let mut live = vec![
            FreeRange {
                start: 0,
                length: HEADER_LENGTH,
            },
            FreeRange {
                start: self.on_disk.mime.0,
                length: self.on_disk.mime.1,
            },
            FreeRange {
                start: self.on_disk.url.0,
                length: self.on_disk.url.1,
            },
            FreeRange {
                start: self.on_disk.title.0,
                length: self.on_disk.title.1,
            },
            FreeRange {
                start: self.on_disk.cluster.0,
                length: self.on_disk.cluster.1,
            },
        ];
        for i in 0..self.url_pointers.len() {
            let offset = self.url_pointers.get(i)?;
            let entry = self.entry_at(offset)?;
            live.push(FreeRange {
                start: offset,
                length: entry.disk_size(),
            });
        }
        // cluster extents are bounded by the next live offset
        let mut starts: Vec<u64> = live.iter().map(|r| r.start).collect();
        starts.extend(self.cluster_pointers.iter());
        starts.sort_unstable();
        let file_end = self.allocator.file_end();
        for offset in self.cluster_pointers.iter().collect::<Vec<_>>() {
            let next = starts
                .iter()
                .copied()
                .find(|&s| s > offset)
                .unwrap_or(file_end)
                .min(file_end);
            live.push(FreeRange {
                start: offset,
                length: next.saturating_sub(offset),
            });
        }
        live.retain(|r| r.length > 0);
        Ok(live)
    }

    fn scan_for_holes(&mut self) -> Result<()> {
        let file_end = self.allocator.file_end();
        let live = self.live_regions()?;
        let holes = SpaceAllocator::holes_between(live, file_end);
        debug!(holes = holes.len(), "allocator rebuilt from hole scan");
        self.allocator = SpaceAllocator::from_holes(
            holes,
            file_end,
            self.policy.alloc_strategy,
            self.policy.coalesce_free_ranges,
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty.any() {
            debug!("flush: no changes");
            return Ok(());
        }
        debug!("flushing archive");

        // Relocate dirty pointer lists: release every outgoing region
        // first, then place the larger list first so competing lists
        // cannot squeeze each other out of a fitting hole.
        let mut jobs: Vec<(&'static str, Vec<u8>)> = Vec::new();
        if self.dirty.cluster_list {
            self.allocator
                .release(self.on_disk.cluster.0, self.on_disk.cluster.1);
            jobs.push(("cluster", self.cluster_pointers.to_bytes()));
        }
        if self.dirty.url_list {
            self.allocator.release(self.on_disk.url.0, self.on_disk.url.1);
            jobs.push(("url", self.url_pointers.to_bytes()));
        }
        if self.dirty.title_list {
            self.allocator
                .release(self.on_disk.title.0, self.on_disk.title.1);
            jobs.push(("title", self.title_pointers.to_bytes()));
        }
        jobs.sort_by_key(|(_, bytes)| std::cmp::Reverse(bytes.len()));
        for (which, bytes) in jobs {
            let pos = if bytes.is_empty() {
                HEADER_LENGTH
            } else {
                let pos = self.allocator.allocate(bytes.len() as u64);
                self.io.write_all_at(pos, &bytes)?;
                pos
            };
            let region = (pos, bytes.len() as u64);
            match which {
                "cluster" => {
                    self.header.cluster_ptr_pos = pos;
                    self.on_disk.cluster = region;
                }
                "url" => {
                    self.header.url_ptr_pos = pos;
                    self.on_disk.url = region;
                }
                _ => {
                    self.header.title_ptr_pos = pos;
                    self.on_disk.title = region;
                }
            }
            trace!(list = which, pos, size = region.1, "pointer list written");
        }

        if self.dirty.mimetypes {
            let bytes = self.mimetypes.to_bytes();
            let region = match self.policy.reserve_mimetype_space {
                // the list lives in its reserved slot behind the header
                Some(reserve) if self.on_disk.mime.0 == HEADER_LENGTH => {
                    if bytes.len() as u64 > reserve {
                        return Err(ZimError::Format(format!(
                            "MIME type list of {} bytes outgrew the reserved {} bytes",
                            bytes.len(),
                            reserve
                        )));
                    }
                    (HEADER_LENGTH, reserve)
                }
                _ => {
                    self.allocator.release(self.on_disk.mime.0, self.on_disk.mime.1);
                    let pos = self.allocator.allocate(bytes.len() as u64);
                    (pos, bytes.len() as u64)
                }
            };
            self.io.write_all_at(region.0, &bytes)?;
            self.header.mime_list_pos = region.0;
            self.on_disk.mime = region;
            trace!(pos = region.0, size = bytes.len(), "MIME type list written");
        }

        self.header.entry_count = self.url_pointers.len() as u32;
        self.header.cluster_count = self.cluster_pointers.len() as u32;
        self.header.checksum_pos = self.allocator.file_end();

        // the header goes last, so readers never see new positions
        // before the structures behind them exist
        self.header.write_to(&mut self.io)?;

        let digest = checksum_of(&mut self.io, self.header.checksum_pos)?;
        self.io.write_all_at(self.header.checksum_pos, &digest)?;
        if self.policy.truncate_after_write {
            self.io
                .set_len(self.header.checksum_pos + CHECKSUM_LENGTH)?;
        }
        self.io.sync()?;

        self.dirty = Dirty::default();
        debug!(
            entries = self.header.entry_count,
            clusters = self.header.cluster_count,
            checksum_pos = self.header.checksum_pos,
            "archive flushed"
        );
        Ok(())
    }
}
