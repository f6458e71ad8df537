//! Index blocks and the packed integer codec.
//!
//! An element area stores a block's integers big-endian at the smallest
//! byte width (the *compaction class*) whose signed range covers every
//! value in the block: 1 = byte, 2 = short, 3 = 24-bit, 4 = int.
//! Decoding sign-extends. Blocks are immutable once written; a mutated
//! block lives in memory until the next index-set commit rewrites it to
//! a fresh area.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{AreaId, Error, Result};
use crate::store::Store;

/// Smallest compaction class covering `v`.
fn class_for_value(v: i64) -> Result<u8> {
    if (-128..=127).contains(&v) {
        Ok(1)
    } else if (-32768..=32767).contains(&v) {
        Ok(2)
    } else if (-(1 << 23)..(1 << 23)).contains(&v) {
        Ok(3)
    } else if (i32::MIN as i64..=i32::MAX as i64).contains(&v) {
        Ok(4)
    } else {
        Err(Error::Corruption(format!(
            "row index {} exceeds the packable range",
            v
        )))
    }
}

/// Smallest compaction class covering every value in `values`.
pub fn compaction_class(values: &[i64]) -> Result<u8> {
    let mut class = 1u8;
    for &v in values {
        class = class.max(class_for_value(v)?);
        if class == 4 {
            break;
        }
    }
    Ok(class)
}

/// Pack `values` big-endian at their compaction class.
pub fn pack_ints(values: &[i64]) -> Result<(u8, Vec<u8>)> {
    let class = compaction_class(values)?;
    let width = class as usize;
    let mut out = Vec::with_capacity(values.len() * width);
    for &v in values {
        let be = v.to_be_bytes();
        out.extend_from_slice(&be[8 - width..]);
    }
    Ok((class, out))
}

/// Unpack `count` integers of the given class, sign-extending.
pub fn unpack_ints(class: u8, count: usize, bytes: &[u8]) -> Result<Vec<i64>> {
    let width = class as usize;
    if !(1..=4).contains(&width) {
        return Err(Error::Corruption(format!("bad compaction class {}", class)));
    }
    if bytes.len() < count * width {
        return Err(Error::Corruption(format!(
            "element area too short: {} < {} x {}",
            bytes.len(),
            count,
            width
        )));
    }
    let mut out = Vec::with_capacity(count);
    for chunk in bytes[..count * width].chunks_exact(width) {
        // Sign-extend from the high byte.
        let fill = if chunk[0] & 0x80 != 0 { 0xFF } else { 0x00 };
        let mut buf = [fill; 8];
        buf[8 - width..].copy_from_slice(chunk);
        out.push(i64::from_be_bytes(buf));
    }
    Ok(out)
}

enum BlockRepr {
    /// Immutable block backed by an element area, decoded lazily.
    Stored {
        store: Arc<dyn Store>,
        area: AreaId,
        count: u32,
        class: u8,
        cache: RwLock<Option<Arc<Vec<i64>>>>,
    },
    /// Mutable block private to one index-set snapshot.
    Memory(Vec<i64>),
}

/// One block of a sorted integer list, with its min/max summary.
pub struct IndexBlock {
    first: i64,
    last: i64,
    repr: BlockRepr,
}

impl IndexBlock {
    /// An in-memory block over `values` (which may be empty).
    pub fn memory(values: Vec<i64>) -> Self {
        let first = values.first().copied().unwrap_or(0);
        let last = values.last().copied().unwrap_or(0);
        Self {
            first,
            last,
            repr: BlockRepr::Memory(values),
        }
    }

    /// A block backed by an element area, not yet decoded.
    pub fn stored(
        store: Arc<dyn Store>,
        area: AreaId,
        count: u32,
        class: u8,
        first: i64,
        last: i64,
    ) -> Self {
        Self {
            first,
            last,
            repr: BlockRepr::Stored {
                store,
                area,
                count,
                class,
                cache: RwLock::new(None),
            },
        }
    }

    /// A stored block whose decoded form is already known (used right
    /// after commit writes a memory block out).
    pub fn stored_primed(
        store: Arc<dyn Store>,
        area: AreaId,
        class: u8,
        values: Arc<Vec<i64>>,
    ) -> Self {
        let first = values.first().copied().unwrap_or(0);
        let last = values.last().copied().unwrap_or(0);
        let count = values.len() as u32;
        Self {
            first,
            last,
            repr: BlockRepr::Stored {
                store,
                area,
                count,
                class,
                cache: RwLock::new(Some(values)),
            },
        }
    }

    #[inline]
    pub fn first(&self) -> i64 {
        self.first
    }

    #[inline]
    pub fn last(&self) -> i64 {
        self.last
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            BlockRepr::Stored { count, .. } => *count as usize,
            BlockRepr::Memory(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this block is an in-memory (mutated) block.
    pub fn is_memory(&self) -> bool {
        matches!(self.repr, BlockRepr::Memory(_))
    }

    /// The element area backing this block, if stored.
    pub fn stored_area(&self) -> Option<AreaId> {
        match &self.repr {
            BlockRepr::Stored { area, .. } => Some(*area),
            BlockRepr::Memory(_) => None,
        }
    }

    /// The compaction class, if stored.
    pub fn stored_class(&self) -> Option<u8> {
        match &self.repr {
            BlockRepr::Stored { class, .. } => Some(*class),
            BlockRepr::Memory(_) => None,
        }
    }

    /// Run `f` over the block's integers, loading them if necessary.
    pub fn with_values<R>(&self, f: impl FnOnce(&[i64]) -> R) -> Result<R> {
        match &self.repr {
            BlockRepr::Memory(v) => Ok(f(v)),
            BlockRepr::Stored {
                store,
                area,
                count,
                class,
                cache,
            } => {
                if let Some(vals) = cache.read().as_ref() {
                    return Ok(f(vals));
                }
                let area_view = store.get_area(*area)?;
                let vals = Arc::new(unpack_ints(*class, *count as usize, area_view.as_slice())?);
                let out = f(&vals);
                *cache.write() = Some(vals);
                Ok(out)
            }
        }
    }

    /// The block's integers as an owned vector.
    pub fn values_vec(&self) -> Result<Vec<i64>> {
        self.with_values(|v| v.to_vec())
    }

    /// Integer at `local` position within the block.
    pub fn value_at(&self, local: usize) -> Result<i64> {
        self.with_values(|v| v[local])
    }

    // ------------------------------------------------------------------
    // Memory-block mutation (list layer guarantees unique ownership)
    // ------------------------------------------------------------------

    pub(crate) fn memory_insert(&mut self, local: usize, v: i64) {
        let BlockRepr::Memory(vals) = &mut self.repr else {
            panic!("mutating a stored index block");
        };
        vals.insert(local, v);
        self.first = vals[0];
        self.last = *vals.last().unwrap();
    }

    pub(crate) fn memory_remove(&mut self, local: usize) -> i64 {
        let BlockRepr::Memory(vals) = &mut self.repr else {
            panic!("mutating a stored index block");
        };
        let out = vals.remove(local);
        self.first = vals.first().copied().unwrap_or(0);
        self.last = vals.last().copied().unwrap_or(0);
        out
    }

    /// Split the upper half into a new block, returning it.
    pub(crate) fn memory_split(&mut self) -> IndexBlock {
        let BlockRepr::Memory(vals) = &mut self.repr else {
            panic!("splitting a stored index block");
        };
        let right = vals.split_off(vals.len() / 2);
        self.first = vals.first().copied().unwrap_or(0);
        self.last = vals.last().copied().unwrap_or(0);
        IndexBlock::memory(right)
    }

    /// Append all of `other`'s values (merge of adjacent blocks).
    pub(crate) fn memory_extend(&mut self, other: &[i64]) {
        let BlockRepr::Memory(vals) = &mut self.repr else {
            panic!("mutating a stored index block");
        };
        vals.extend_from_slice(other);
        self.first = vals.first().copied().unwrap_or(0);
        self.last = vals.last().copied().unwrap_or(0);
    }
}
