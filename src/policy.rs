//! Archive behavior policies
//!
//! A policy is a plain configuration record governing resource management
//! and write behavior: cache sizes, the cluster representation used for
//! reads, allocation strategy, redirect depth, checksum handling and the
//! compression applied to new clusters. Policies never change what an
//! archive *contains*, only how it is processed and laid out.

use serde::{Deserialize, Serialize};

use crate::allocator::AllocStrategy;
use crate::cluster::ClusterRepresentation;
use crate::compression::CompressionType;

/// Tunables recognized by the archive and its subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Entry cache size in entries; 0 disables, `usize::MAX` is unbounded.
    pub entry_cache_capacity: usize,
    /// Cluster cache size in clusters; 0 disables, `usize::MAX` is unbounded.
    pub cluster_cache_capacity: usize,
    /// In-memory shape for clusters loaded on the read path.
    pub cluster_representation: ClusterRepresentation,
    /// How the space allocator picks among sufficient holes.
    pub alloc_strategy: AllocStrategy,
    /// Merge adjacent free ranges (and shrink a trailing one away).
    pub coalesce_free_ranges: bool,
    /// Redirect chains longer than this fail with `RedirectTooDeep`.
    pub redirect_max_depth: u32,
    /// Compare the MD5 trailer against the file contents at open time.
    pub verify_checksum_on_open: bool,
    /// Truncate the file to `checksum_pos + 16` when flushing.
    pub truncate_after_write: bool,
    /// Compression applied to newly written clusters.
    pub compression: CompressionType,
    /// Bytes reserved directly after the header for the MIME type list;
    /// `None` lets the list be relocated like any other structure.
    pub reserve_mimetype_space: Option<u64>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            entry_cache_capacity: 64,
            cluster_cache_capacity: 8,
            cluster_representation: ClusterRepresentation::OffsetOnly,
            alloc_strategy: AllocStrategy::BestFit,
            coalesce_free_ranges: true,
            redirect_max_depth: 16,
            verify_checksum_on_open: false,
            truncate_after_write: false,
            compression: CompressionType::Zstd,
            reserve_mimetype_space: Some(2048),
        }
    }
}

impl Policy {
    /// Minimize resident memory: no caches, streaming decompression.
    pub fn low_memory() -> Self {
        Policy {
            entry_cache_capacity: 0,
            cluster_cache_capacity: 0,
            cluster_representation: ClusterRepresentation::Streaming,
            ..Policy::default()
        }
    }

    /// Trade memory for read speed: big caches, materialized clusters.
    pub fn high_performance() -> Self {
        Policy {
            entry_cache_capacity: 1024,
            cluster_cache_capacity: 32,
            cluster_representation: ClusterRepresentation::InMemory,
            ..Policy::default()
        }
    }
}
