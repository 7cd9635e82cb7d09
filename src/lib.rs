//! # zim-core — ZIM archive engine
//!
//! Read, write and edit ZIM archives: the content-addressed container
//! format used to ship compressed offline snapshots of web corpora.
//!
//! The crate covers the on-disk format and its editing machinery:
//!
//! - [`header`] - the fixed 80-byte archive header
//! - [`mimetypes`] - the index → MIME string table
//! - [`pointerlist`] - the URL, title and cluster pointer lists
//! - [`entry`] - content and redirect directory entries
//! - [`cluster`] - compressed blob groups with three read representations
//! - [`compression`] - the pluggable codec registry (identity, xz, zstd)
//! - [`cache`] - bounded LRU caches with pinnable slots
//! - [`allocator`] - the free-space allocator recycling holes left by edits
//! - [`policy`] - the tunables governing all of the above
//! - [`archive`] - the [`Zim`](archive::Zim) handle tying it together
//!
//! ## Reading
//!
//! ```rust,no_run
//! use zim_core::{OpenMode, Zim};
//!
//! # fn main() -> zim_core::Result<()> {
//! let zim = Zim::open("wiki.zim", OpenMode::Read)?;
//! let entry = zim.get_content_entry_by_url("index.html")?;
//! let html = entry.read()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Editing
//!
//! ```rust,no_run
//! use zim_core::{Item, OpenMode, Zim};
//!
//! # fn main() -> zim_core::Result<()> {
//! let zim = Zim::open("wiki.zim", OpenMode::Update)?;
//! zim.add_item(Item {
//!     namespace: b'C',
//!     url: "hello".into(),
//!     title: "Hello".into(),
//!     mimetype: "text/plain".into(),
//!     content: b"Hello\n".to_vec(),
//! })?;
//! zim.remove_entry(b'C', "stale-page")?;
//! zim.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! One archive handle is single-threaded; open the archive once per
//! thread for concurrent reads. Writers need exclusive access.

pub mod allocator;
pub mod archive;
pub mod cache;
pub mod cluster;
pub mod compression;
pub mod entry;
pub mod error;
pub mod header;
pub mod io;
pub mod mimetypes;
pub mod pointerlist;
pub mod policy;

// Re-export commonly used types
pub use allocator::{AllocStrategy, FreeRange, SpaceAllocator};
pub use archive::{Item, Zim};
pub use cache::{Cache, CacheStats};
pub use cluster::{Cluster, ClusterBuilder, ClusterRepresentation};
pub use compression::{Codec, CompressionRegistry, CompressionType};
pub use entry::{Entry, EntryKind};
pub use error::{Result, ZimError};
pub use header::Header;
pub use io::OpenMode;
pub use mimetypes::MimeTypeList;
pub use policy::Policy;
pub use uuid::Uuid;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
