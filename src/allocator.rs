//! Free-space tracking for the archive file
//!
//! Editing leaves holes: an entry outgrows its slot, a cluster is
//! rewritten elsewhere, a pointer list is relocated. The allocator keeps
//! those holes as a sorted set of `[start, length)` ranges plus the
//! logical file end, and hands them back to later writes instead of
//! growing the file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Hole-picking strategy for [`SpaceAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocStrategy {
    /// Lowest-offset hole that fits.
    FirstFit,
    /// Smallest hole that fits; ties go to the lowest offset.
    BestFit,
}

/// One free range, for snapshots and hole scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRange {
    pub start: u64,
    pub length: u64,
}

/// Sorted free-range set with an open end.
///
/// Invariants: ranges are disjoint, sorted by start, never zero-length,
/// and never extend past `file_end`.
#[derive(Debug, Clone)]
pub struct SpaceAllocator {
    /// start → length
    free: BTreeMap<u64, u64>,
    /// Offset of the first byte past the logical end of the file.
    file_end: u64,
    strategy: AllocStrategy,
    coalesce: bool,
}

impl SpaceAllocator {
    /// An allocator with no holes, appending at `file_end`.
    pub fn new(file_end: u64, strategy: AllocStrategy, coalesce: bool) -> Self {
        SpaceAllocator {
            free: BTreeMap::new(),
            file_end,
            strategy,
            coalesce,
        }
    }

    /// An allocator seeded with known holes.
    pub fn from_holes(
        holes: impl IntoIterator<Item = FreeRange>,
        file_end: u64,
        strategy: AllocStrategy,
        coalesce: bool,
    ) -> Self {
        let mut allocator = Self::new(file_end, strategy, coalesce);
        for hole in holes {
            allocator.release(hole.start, hole.length);
        }
        allocator
    }

    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// Total bytes currently free (excluding the open end).
    pub fn total_free(&self) -> u64 {
        self.free.values().sum()
    }

    /// The current holes, sorted by start.
    pub fn snapshot(&self) -> Vec<FreeRange> {
        self.free
            .iter()
            .map(|(&start, &length)| FreeRange { start, length })
            .collect()
    }

    /// Reserve `size` bytes and return the offset to write them at.
    ///
    /// Picks a hole per strategy; with no hole large enough, a free range
    /// touching the file end is consumed before the file is grown.
    pub fn allocate(&mut self, size: u64) -> u64 {
        if size == 0 {
            warn!("allocation of 0 bytes requested, likely a bug in the caller");
            return self.file_end;
        }

        let candidate = match self.strategy {
            AllocStrategy::FirstFit => self
                .free
                .iter()
                .find(|(_, &len)| len >= size)
                .map(|(&start, &len)| (start, len)),
            AllocStrategy::BestFit => self
                .free
                .iter()
                .filter(|(_, &len)| len >= size)
                .min_by_key(|(_, &len)| len)
                .map(|(&start, &len)| (start, len)),
        };

        if let Some((start, len)) = candidate {
            self.free.remove(&start);
            if len > size {
                self.free.insert(start + size, len - size);
            }
            trace!(offset = start, size, remaining = len - size, "allocated from hole");
            return start;
        }

        // No hole fits. A trailing free range abutting the file end can
        // still seed the allocation before new bytes are appended.
        if let Some((&start, &len)) = self.free.iter().next_back() {
            if start + len == self.file_end {
                self.free.remove(&start);
                self.file_end = start + size;
                trace!(offset = start, size, recycled = len, "allocated at file end, recycling trailing hole");
                return start;
            }
        }

        let start = self.file_end;
        self.file_end += size;
        trace!(offset = start, size, "allocated at file end");
        start
    }

    /// Return `[start, start + length)` to the free set.
    ///
    /// With coalescing enabled, adjacent and overlapping neighbors are
    /// merged, and a merged range ending at the file end shrinks the
    /// logical file instead of lingering as a trailing hole.
    pub fn release(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        trace!(offset = start, size = length, "released range");

        let mut start = start;
        let mut end = start + length;

        if self.coalesce {
            // neighbor before
            if let Some((&prev_start, &prev_len)) = self.free.range(..=start).next_back() {
                if prev_start + prev_len >= start {
                    start = prev_start;
                    end = end.max(prev_start + prev_len);
                    self.free.remove(&prev_start);
                }
            }
            // neighbors after, until a gap
            while let Some((&next_start, &next_len)) = self.free.range(start..).next() {
                if next_start <= end {
                    end = end.max(next_start + next_len);
                    self.free.remove(&next_start);
                } else {
                    break;
                }
            }
            if end == self.file_end {
                // trailing hole: give the bytes back to the open end
                self.file_end = start;
                trace!(file_end = start, "shrunk file end over trailing hole");
                return;
            }
        }

        self.free.insert(start, end - start);
    }

    /// Compute the holes of `[0, file_end)` not covered by `live`
    /// regions, e.g. when (re)building the allocator for an existing
    /// archive.
    pub fn holes_between(mut live: Vec<FreeRange>, file_end: u64) -> Vec<FreeRange> {
        live.sort_by_key(|r| r.start);
        let mut holes = Vec::new();
        let mut cursor = 0u64;
        for region in live {
            if region.start > cursor {
                holes.push(FreeRange {
                    start: cursor,
                    length: region.start - cursor,
                });
            }
            cursor = cursor.max(region.start + region.length);
        }
        if cursor < file_end {
            holes.push(FreeRange {
                start: cursor,
                length: file_end - cursor,
            });
        }
        holes
    }
}
