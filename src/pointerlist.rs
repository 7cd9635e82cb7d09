//! URL, title and cluster pointer lists
//!
//! Three parallel index arrays drive every lookup: the URL pointer list
//! (64-bit entry offsets sorted by full URL), the title pointer list
//! (32-bit indices into the URL list sorted by title) and the cluster
//! pointer list (64-bit cluster offsets). The list itself is order-
//! agnostic; keeping it sorted is the archive's responsibility, checked
//! with [`PointerList::check_sorted`].

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, ZimError};
use crate::io::ArchiveFile;

/// A fixed-width little-endian pointer value.
pub trait Pointer: Copy + Eq {
    const WIDTH: u64;
    fn read(buf: &[u8]) -> Self;
    fn write(self, out: &mut Vec<u8>);
}

impl Pointer for u64 {
    const WIDTH: u64 = 8;
    fn read(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Pointer for u32 {
    const WIDTH: u64 = 4;
    fn read(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// An indexable pointer array backed by the archive on read, in memory
/// once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerList<P: Pointer> {
    pointers: Vec<P>,
}

impl<P: Pointer> PointerList<P> {
    pub fn new(pointers: Vec<P>) -> Self {
        PointerList { pointers }
    }

    /// Read `n` pointers at `pos`.
    pub fn read_from(io: &mut ArchiveFile, pos: u64, n: u32) -> Result<Self> {
        let total = (n as u64 * P::WIDTH) as usize;
        let bytes = io.read_vec_at(pos, total)?;
        let mut pointers = Vec::with_capacity(n as usize);
        for chunk in bytes.chunks_exact(P::WIDTH as usize) {
            pointers.push(P::read(chunk));
        }
        Ok(PointerList { pointers })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.disk_size() as usize);
        for p in &self.pointers {
            p.write(&mut out);
        }
        out
    }

    pub fn disk_size(&self) -> u64 {
        self.pointers.len() as u64 * P::WIDTH
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    pub fn get(&self, i: usize) -> Result<P> {
        self.pointers.get(i).copied().ok_or_else(|| {
            ZimError::Format(format!(
                "pointer index {} out of range {}",
                i,
                self.pointers.len()
            ))
        })
    }

    pub fn set(&mut self, i: usize, value: P) {
        self.pointers[i] = value;
    }

    pub fn insert(&mut self, i: usize, value: P) {
        self.pointers.insert(i, value);
    }

    pub fn remove(&mut self, i: usize) -> P {
        self.pointers.remove(i)
    }

    pub fn push(&mut self, value: P) {
        self.pointers.push(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = P> + '_ {
        self.pointers.iter().copied()
    }

    /// Position of the first pointer in the list equal to `value`.
    pub fn position_of(&self, value: P) -> Option<usize> {
        self.pointers.iter().position(|&p| p == value)
    }

    /// First index whose key is not less than the search target.
    ///
    /// `is_less` reports whether the key behind a pointer sorts strictly
    /// before the target; it may touch the archive, hence the fallible
    /// signature. Mirrors `bisect_left`.
    pub fn lower_bound<F>(&self, mut is_less: F) -> Result<usize>
    where
        F: FnMut(P) -> Result<bool>,
    {
        let mut lo = 0usize;
        let mut hi = self.pointers.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if is_less(self.pointers[mid])? {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Verify the list is sorted under `key`, failing with a format error
    /// on the first violation.
    pub fn check_sorted<K, F>(&self, mut key: F) -> Result<()>
    where
        K: Ord,
        F: FnMut(P) -> Result<K>,
    {
        let mut last: Option<K> = None;
        for &p in &self.pointers {
            let k = key(p)?;
            if let Some(prev) = &last {
                if *prev > k {
                    return Err(ZimError::Format(
                        "pointer list contains keys in the wrong order".to_string(),
                    ));
                }
            }
            last = Some(k);
        }
        Ok(())
    }
}

impl PointerList<u32> {
    /// Shift every stored index `>= start` by `diff`.
    ///
    /// Needed when an insertion or removal in the URL pointer list
    /// renumbers the entries that title pointers refer to.
    pub fn mass_update(&mut self, start: u32, diff: i64) {
        for p in &mut self.pointers {
            if *p >= start {
                *p = (*p as i64 + diff) as u32;
            }
        }
    }
}
