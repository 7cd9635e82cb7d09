//! Clusters: grouped, optionally compressed blob storage
//!
//! A cluster starts with one info byte (low four bits: compression tag,
//! bit 4: "extended", i.e. 64-bit offsets). The body — decompressed when
//! the tag requires it — is an offset table of `blob_count + 1` values
//! measured from the table start, followed by the concatenated blobs.
//!
//! Three read representations implement the same observable contract and
//! are chosen by [`crate::policy::Policy::cluster_representation`]:
//! offset-only (table plus decompressed body kept, blobs sliced on
//! demand), in-memory (materialized blob list) and streaming (only the
//! table kept; every blob access re-opens a decode stream and skips to
//! the blob, so random access degrades to re-decompression but memory
//! stays bounded).

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::compression::{CompressionRegistry, CompressionType};
use crate::error::{Result, ZimError};
use crate::io::ArchiveFile;

/// Bit 4 of the info byte: offsets are 64-bit.
const EXTENDED_FLAG: u8 = 0b0001_0000;

/// Which in-memory shape a cluster takes on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRepresentation {
    /// Keep the offset table and the decompressed body; slice on demand.
    OffsetOnly,
    /// Materialize every blob eagerly; fastest random access.
    InMemory,
    /// Keep only the offset table; re-decompress per access.
    Streaming,
}

#[derive(Debug)]
enum Repr {
    OffsetOnly {
        offsets: Vec<u64>,
        /// Blob bytes only, without the offset table.
        blob_area: Vec<u8>,
    },
    InMemory {
        blobs: Vec<Vec<u8>>,
    },
    Streaming {
        /// Absolute offset of the cluster in the archive.
        cluster_offset: u64,
        offsets: Vec<u64>,
    },
}

/// A parsed cluster in one of the three read representations.
#[derive(Debug)]
pub struct Cluster {
    tag: u8,
    extended: bool,
    repr: Repr,
}

fn offset_width(extended: bool) -> u64 {
    if extended {
        8
    } else {
        4
    }
}

fn read_offset(r: &mut dyn Read, extended: bool) -> Result<u64> {
    let truncated = |_| ZimError::Format("cluster body ends inside the offset table".to_string());
    if extended {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).map_err(truncated)?;
        Ok(u64::from_le_bytes(buf))
    } else {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(truncated)?;
        Ok(u64::from(u32::from_le_bytes(buf)))
    }
}

/// Discard exactly `n` bytes from a stream.
fn skip_bytes(r: &mut dyn Read, mut n: u64) -> Result<()> {
    let mut scratch = [0u8; 8192];
    while n > 0 {
        let want = n.min(scratch.len() as u64) as usize;
        let got = r.read(&mut scratch[..want])?;
        if got == 0 {
            return Err(ZimError::Format(
                "cluster body shorter than its offset table claims".to_string(),
            ));
        }
        n -= got as u64;
    }
    Ok(())
}

fn read_exact_body(r: &mut dyn Read, n: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf)
        .map_err(|_| ZimError::Format("cluster body shorter than its offset table claims".to_string()))?;
    Ok(buf)
}

/// Parse the offset table from an open decode stream.
///
/// The first offset pins the table size (`first / width` offsets) and the
/// last offset the total body length; both are validated here.
fn read_offset_table(r: &mut dyn Read, extended: bool) -> Result<Vec<u64>> {
    let width = offset_width(extended);
    let first = read_offset(r, extended)?;
    if first == 0 || first % width != 0 {
        return Err(ZimError::Format(format!(
            "first cluster offset {first} is not a positive multiple of {width}"
        )));
    }
    let count = first / width;
    // capacity capped so a corrupt first offset cannot force a huge
    // allocation before the reads below fail
    let mut offsets = Vec::with_capacity(count.min(4096) as usize);
    offsets.push(first);
    for _ in 1..count {
        let next = read_offset(r, extended)?;
        if next < *offsets.last().unwrap() {
            return Err(ZimError::Format(
                "cluster offset table is not non-decreasing".to_string(),
            ));
        }
        offsets.push(next);
    }
    Ok(offsets)
}

impl Cluster {
    /// Read and parse the cluster at `offset`, decompressing through
    /// `registry` as its info byte demands.
    ///
    /// A compression tag with no registered codec fails here with
    /// [`ZimError::UnsupportedCompression`] — the first access to the
    /// cluster, never earlier.
    pub(crate) fn read_from(
        io: &mut ArchiveFile,
        registry: &CompressionRegistry,
        offset: u64,
        representation: ClusterRepresentation,
    ) -> Result<Cluster> {
        let info = io.read_u8_at(offset)?;
        let tag = info & 0x0F;
        let extended = info & EXTENDED_FLAG != 0;
        let codec = registry.get(tag)?;

        let raw = io.reader_at(offset + 1)?;
        let mut body = codec.decode_stream(Box::new(raw))?;
        let offsets = read_offset_table(&mut body, extended)?;
        let first = offsets[0];
        let last = *offsets.last().unwrap();

        let repr = match representation {
            ClusterRepresentation::Streaming => Repr::Streaming {
                cluster_offset: offset,
                offsets,
            },
            ClusterRepresentation::OffsetOnly => {
                let blob_area = read_exact_body(&mut body, last - first)?;
                Repr::OffsetOnly { offsets, blob_area }
            }
            ClusterRepresentation::InMemory => {
                let blob_area = read_exact_body(&mut body, last - first)?;
                let blobs = offsets
                    .windows(2)
                    .map(|w| blob_area[(w[0] - first) as usize..(w[1] - first) as usize].to_vec())
                    .collect();
                Repr::InMemory { blobs }
            }
        };
        Ok(Cluster {
            tag,
            extended,
            repr,
        })
    }

    pub fn compression_tag(&self) -> u8 {
        self.tag
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn blob_count(&self) -> u32 {
        match &self.repr {
            Repr::OffsetOnly { offsets, .. } | Repr::Streaming { offsets, .. } => {
                (offsets.len() - 1) as u32
            }
            Repr::InMemory { blobs } => blobs.len() as u32,
        }
    }

    /// Decompressed size of blob `i`.
    pub fn blob_size(&self, i: u32) -> Result<u64> {
        let i = i as usize;
        match &self.repr {
            Repr::OffsetOnly { offsets, .. } | Repr::Streaming { offsets, .. } => {
                if i + 1 >= offsets.len() {
                    return Err(ZimError::NotFound(format!("blob {i} in cluster")));
                }
                Ok(offsets[i + 1] - offsets[i])
            }
            Repr::InMemory { blobs } => blobs
                .get(i)
                .map(|b| b.len() as u64)
                .ok_or_else(|| ZimError::NotFound(format!("blob {i} in cluster"))),
        }
    }

    /// Read blob `i`. The streaming representation goes back to the file,
    /// hence the archive's I/O handle and codec registry.
    pub(crate) fn read_blob(
        &self,
        io: &mut ArchiveFile,
        registry: &CompressionRegistry,
        i: u32,
    ) -> Result<Vec<u8>> {
        let idx = i as usize;
        match &self.repr {
            Repr::InMemory { blobs } => blobs
                .get(idx)
                .cloned()
                .ok_or_else(|| ZimError::NotFound(format!("blob {i} in cluster"))),
            Repr::OffsetOnly { offsets, blob_area } => {
                if idx + 1 >= offsets.len() {
                    return Err(ZimError::NotFound(format!("blob {i} in cluster")));
                }
                let first = offsets[0];
                let start = (offsets[idx] - first) as usize;
                let end = (offsets[idx + 1] - first) as usize;
                Ok(blob_area[start..end].to_vec())
            }
            Repr::Streaming {
                cluster_offset,
                offsets,
            } => {
                if idx + 1 >= offsets.len() {
                    return Err(ZimError::NotFound(format!("blob {i} in cluster")));
                }
                let size = offsets[idx + 1] - offsets[idx];
                let codec = registry.get(self.tag)?;
                let raw = io.reader_at(cluster_offset + 1)?;
                let mut body = codec.decode_stream(Box::new(raw))?;
                skip_bytes(&mut body, offsets[idx])?;
                read_exact_body(&mut body, size)
            }
        }
    }
}

/// Write-side cluster under construction, always fully materialized.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    compression: CompressionType,
    blobs: Vec<Vec<u8>>,
}

impl ClusterBuilder {
    pub fn new(compression: CompressionType) -> Self {
        ClusterBuilder {
            compression,
            blobs: Vec::new(),
        }
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    pub fn blob_count(&self) -> u32 {
        self.blobs.len() as u32
    }

    /// Append a blob, returning its blob number.
    pub fn push_blob(&mut self, data: impl Into<Vec<u8>>) -> u32 {
        self.blobs.push(data.into());
        (self.blobs.len() - 1) as u32
    }

    /// Replace the contents of blob `i`. Emptying a blob keeps all later
    /// blob numbers stable, which is how entries are detached from shared
    /// clusters.
    pub fn set_blob(&mut self, i: u32, data: impl Into<Vec<u8>>) {
        self.blobs[i as usize] = data.into();
    }

    fn body_layout(&self) -> (bool, u64) {
        // Try narrow offsets first; fall back to the extended layout when
        // the body outgrows u32.
        for extended in [false, true] {
            let width = offset_width(extended);
            let table = (self.blobs.len() as u64 + 1) * width;
            let total: u64 = table + self.blobs.iter().map(|b| b.len() as u64).sum::<u64>();
            if !extended && total > u64::from(u32::MAX) {
                continue;
            }
            return (extended, total);
        }
        unreachable!()
    }

    /// Whether serialization will use 64-bit offsets.
    pub fn is_extended(&self) -> bool {
        self.body_layout().0
    }

    /// Serialize to the on-disk form: info byte plus the (optionally
    /// compressed) offset table and blob bytes.
    pub fn serialize(&self, registry: &CompressionRegistry) -> Result<Vec<u8>> {
        let (extended, total) = self.body_layout();
        let width = offset_width(extended);
        let mut body = Vec::with_capacity(total as usize);
        let mut running = (self.blobs.len() as u64 + 1) * width;
        for blob in self.blobs.iter() {
            write_offset(&mut body, running, extended);
            running += blob.len() as u64;
        }
        write_offset(&mut body, running, extended);
        for blob in &self.blobs {
            body.extend_from_slice(blob);
        }
        debug_assert_eq!(body.len() as u64, total);

        let tag = self.compression.tag();
        let encoded = registry.get(tag)?.encode(&body)?;
        let mut out = Vec::with_capacity(encoded.len() + 1);
        out.push(tag | if extended { EXTENDED_FLAG } else { 0 });
        out.extend_from_slice(&encoded);
        Ok(out)
    }
}

fn write_offset(out: &mut Vec<u8>, value: u64, extended: bool) {
    if extended {
        out.extend_from_slice(&value.to_le_bytes());
    } else {
        out.extend_from_slice(&(value as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::TAG_XZ;
    use tempfile::NamedTempFile;

    const REPRS: [ClusterRepresentation; 3] = [
        ClusterRepresentation::OffsetOnly,
        ClusterRepresentation::InMemory,
        ClusterRepresentation::Streaming,
    ];

    fn write_cluster(
        builder: &ClusterBuilder,
    ) -> (NamedTempFile, ArchiveFile, CompressionRegistry, u64) {
        let registry = CompressionRegistry::builtin();
        let temp = NamedTempFile::new().unwrap();
        let mut io = ArchiveFile::create(temp.path()).unwrap();
        let bytes = builder.serialize(&registry).unwrap();
        io.write_all_at(64, &bytes).unwrap();
        (temp, io, registry, 64)
    }

    #[test]
    fn test_round_trip_across_representations() {
        let mut builder = ClusterBuilder::new(CompressionType::Xz);
        builder.push_blob(b"first blob".to_vec());
        builder.push_blob(Vec::new());
        builder.push_blob(b"third".to_vec());
        let (_temp, mut io, registry, pos) = write_cluster(&builder);

        for repr in REPRS {
            let cluster = Cluster::read_from(&mut io, &registry, pos, repr).unwrap();
            assert_eq!(cluster.compression_tag(), TAG_XZ);
            assert!(!cluster.is_extended());
            assert_eq!(cluster.blob_count(), 3);
            assert_eq!(cluster.blob_size(1).unwrap(), 0);
            assert_eq!(
                cluster.read_blob(&mut io, &registry, 0).unwrap(),
                b"first blob"
            );
            assert_eq!(cluster.read_blob(&mut io, &registry, 1).unwrap(), b"");
            assert_eq!(cluster.read_blob(&mut io, &registry, 2).unwrap(), b"third");
            assert!(matches!(
                cluster.read_blob(&mut io, &registry, 3),
                Err(ZimError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_uncompressed_cluster() {
        let mut builder = ClusterBuilder::new(CompressionType::None);
        builder.push_blob(b"Hello\n".to_vec());
        let (_temp, mut io, registry, pos) = write_cluster(&builder);

        let cluster =
            Cluster::read_from(&mut io, &registry, pos, ClusterRepresentation::OffsetOnly)
                .unwrap();
        assert_eq!(cluster.blob_count(), 1);
        assert_eq!(cluster.read_blob(&mut io, &registry, 0).unwrap(), b"Hello\n");
    }

    #[test]
    fn test_empty_cluster() {
        let builder = ClusterBuilder::new(CompressionType::None);
        let bytes = builder.serialize(&CompressionRegistry::builtin()).unwrap();
        // info byte + one 4-byte offset pointing past itself
        assert_eq!(bytes, vec![1, 4, 0, 0, 0]);

        let (_temp, mut io, registry, pos) = write_cluster(&builder);
        for repr in REPRS {
            let cluster = Cluster::read_from(&mut io, &registry, pos, repr).unwrap();
            assert_eq!(cluster.blob_count(), 0);
            assert!(cluster.read_blob(&mut io, &registry, 0).is_err());
        }
    }

    #[test]
    fn test_blob_edits_in_builder() {
        let mut builder = ClusterBuilder::new(CompressionType::None);
        let a = builder.push_blob(b"aaa".to_vec());
        let b = builder.push_blob(b"bbb".to_vec());
        builder.set_blob(a, Vec::new());
        let (_temp, mut io, registry, pos) = write_cluster(&builder);

        let cluster =
            Cluster::read_from(&mut io, &registry, pos, ClusterRepresentation::InMemory).unwrap();
        assert_eq!(cluster.read_blob(&mut io, &registry, a).unwrap(), b"");
        // blob numbers after the emptied one are unchanged
        assert_eq!(cluster.read_blob(&mut io, &registry, b).unwrap(), b"bbb");
    }

    #[test]
    fn test_unknown_tag_fails_on_first_access() {
        let temp = NamedTempFile::new().unwrap();
        let mut io = ArchiveFile::create(temp.path()).unwrap();
        // tag 3 (bz2) is reserved and never registered
        io.write_all_at(0, &[3, 4, 0, 0, 0]).unwrap();
        let registry = CompressionRegistry::builtin();
        assert!(matches!(
            Cluster::read_from(&mut io, &registry, 0, ClusterRepresentation::OffsetOnly),
            Err(ZimError::UnsupportedCompression(3))
        ));
    }

    #[test]
    fn test_descending_offsets_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let mut io = ArchiveFile::create(temp.path()).unwrap();
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(&16u32.to_le_bytes()); // decreasing
        bytes.extend_from_slice(&[0u8; 8]);
        io.write_all_at(0, &bytes).unwrap();

        let registry = CompressionRegistry::builtin();
        assert!(matches!(
            Cluster::read_from(&mut io, &registry, 0, ClusterRepresentation::OffsetOnly),
            Err(ZimError::Format(_))
        ));
    }

    #[test]
    fn test_misaligned_first_offset_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let mut io = ArchiveFile::create(temp.path()).unwrap();
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&6u32.to_le_bytes()); // not a multiple of 4
        bytes.extend_from_slice(&[0u8; 8]);
        io.write_all_at(0, &bytes).unwrap();

        let registry = CompressionRegistry::builtin();
        assert!(matches!(
            Cluster::read_from(&mut io, &registry, 0, ClusterRepresentation::OffsetOnly),
            Err(ZimError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let mut io = ArchiveFile::create(temp.path()).unwrap();
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes()); // body claims 92 blob bytes
        bytes.extend_from_slice(b"short");
        io.write_all_at(0, &bytes).unwrap();

        let registry = CompressionRegistry::builtin();
        assert!(matches!(
            Cluster::read_from(&mut io, &registry, 0, ClusterRepresentation::InMemory),
            Err(ZimError::Format(_))
        ));
    }
}
