//! Cluster compression codecs
//!
//! Clusters are compressed as a unit; the low four bits of the cluster
//! info byte select the codec. The registry maps that tag to a [`Codec`]
//! producing decode streams and encoded buffers. Codecs can be registered
//! and removed at runtime: a missing codec is a runtime condition surfaced
//! as [`ZimError::UnsupportedCompression`] on first access to an affected
//! cluster, never earlier.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZimError};

/// Compression tag for uncompressed clusters as written by this crate.
pub const TAG_NONE: u8 = 1;
/// Compression tag for xz/LZMA2 clusters.
pub const TAG_XZ: u8 = 4;
/// Compression tag for zstd clusters.
pub const TAG_ZSTD: u8 = 5;
/// Reserved zstd variant tag, decoded identically to [`TAG_ZSTD`].
pub const TAG_ZSTD_EXT: u8 = 6;

/// The compression families a cluster can be written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Xz,
    Zstd,
}

impl CompressionType {
    /// The tag byte written into the cluster info byte.
    pub fn tag(&self) -> u8 {
        match self {
            CompressionType::None => TAG_NONE,
            CompressionType::Xz => TAG_XZ,
            CompressionType::Zstd => TAG_ZSTD,
        }
    }
}

/// One compression codec: a decoder stream factory plus a whole-buffer
/// encoder. Clusters are fully materialized before compression, so the
/// encode side never needs streaming.
pub trait Codec {
    /// Name of the underlying implementation, for diagnostics.
    fn name(&self) -> &'static str;

    /// Wrap a raw byte stream in a decoding reader.
    fn decode_stream<'a>(&self, r: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>>;

    /// Compress an entire buffer.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through codec for uncompressed clusters (tags 0 and 1).
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn decode_stream<'a>(&self, r: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        Ok(r)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// xz/LZMA2 codec (tag 4).
pub struct XzCodec {
    level: u32,
}

impl XzCodec {
    pub fn new() -> Self {
        XzCodec { level: 6 }
    }
}

impl Default for XzCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for XzCodec {
    fn name(&self) -> &'static str {
        "xz"
    }

    fn decode_stream<'a>(&self, r: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        Ok(Box::new(xz2::read::XzDecoder::new(r)))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
}

/// zstd codec (tags 5 and 6).
#[cfg(feature = "zstd")]
pub struct ZstdCodec {
    level: i32,
}

#[cfg(feature = "zstd")]
impl ZstdCodec {
    pub fn new() -> Self {
        ZstdCodec { level: 3 }
    }
}

#[cfg(feature = "zstd")]
impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "zstd")]
impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn decode_stream<'a>(&self, r: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(r)?))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(data, self.level)?)
    }
}

/// Tag byte → codec mapping for one archive handle.
#[derive(Clone)]
pub struct CompressionRegistry {
    codecs: HashMap<u8, Rc<dyn Codec>>,
}

impl CompressionRegistry {
    /// A registry with no codecs at all, not even identity.
    pub fn empty() -> Self {
        CompressionRegistry {
            codecs: HashMap::new(),
        }
    }

    /// The built-in codec set: identity on tags 0 and 1, xz on tag 4,
    /// and zstd on tags 5 and 6 when compiled in.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let identity: Rc<dyn Codec> = Rc::new(IdentityCodec);
        registry.register(0, Rc::clone(&identity));
        registry.register(TAG_NONE, identity);
        registry.register(TAG_XZ, Rc::new(XzCodec::new()));
        #[cfg(feature = "zstd")]
        {
            let zstd: Rc<dyn Codec> = Rc::new(ZstdCodec::new());
            registry.register(TAG_ZSTD, Rc::clone(&zstd));
            registry.register(TAG_ZSTD_EXT, zstd);
        }
        registry
    }

    pub fn register(&mut self, tag: u8, codec: Rc<dyn Codec>) {
        self.codecs.insert(tag, codec);
    }

    pub fn unregister(&mut self, tag: u8) {
        self.codecs.remove(&tag);
    }

    pub fn has(&self, tag: u8) -> bool {
        self.codecs.contains_key(&tag)
    }

    pub fn get(&self, tag: u8) -> Result<&dyn Codec> {
        self.codecs
            .get(&tag)
            .map(|c| c.as_ref())
            .ok_or(ZimError::UnsupportedCompression(tag))
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
