//! Content-addressable large-object store.
//!
//! Cell values above the configured thresholds are stored out-of-line as
//! their own store areas; the row record then carries an opaque
//! [`BlobRef`] instead of inline bytes. Refs are content-agnostic to
//! callers and encode to a fixed 17-byte form.

use std::sync::Arc;

use crate::common::value::{read_i64, read_u8};
use crate::common::{AreaId, Error, Result};
use crate::store::Store;

/// Encoded size of a [`BlobRef`] within a row record.
pub const BLOB_REF_ENCODED_LEN: usize = 17;

/// What kind of value a blob area holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Text = 1,
    Binary = 2,
}

impl BlobKind {
    fn from_u8(v: u8) -> Result<BlobKind> {
        match v {
            1 => Ok(BlobKind::Text),
            2 => Ok(BlobKind::Binary),
            _ => Err(Error::Corruption(format!("unknown blob kind {}", v))),
        }
    }
}

/// Opaque reference to an out-of-line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub area: AreaId,
    pub len: u64,
    pub kind: BlobKind,
}

impl BlobRef {
    /// Append the 17-byte encoding to `out`.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.extend_from_slice(&self.area.0.to_be_bytes());
        out.extend_from_slice(&(self.len as i64).to_be_bytes());
    }

    /// Decode a ref produced by [`BlobRef::encode_to`].
    pub fn decode(bytes: &[u8], pos: &mut usize) -> Result<BlobRef> {
        let kind = BlobKind::from_u8(read_u8(bytes, pos)?)?;
        let area = AreaId::new(read_i64(bytes, pos)?);
        let len = read_i64(bytes, pos)? as u64;
        Ok(BlobRef { area, len, kind })
    }
}

/// Large-object store built on a [`Store`].
pub struct BlobStore {
    store: Arc<dyn Store>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn put(&self, kind: BlobKind, bytes: &[u8]) -> Result<BlobRef> {
        let mut w = self.store.create_area(1 + bytes.len())?;
        w.write_u8(kind as u8);
        w.write_bytes(bytes);
        let area = w.finish(self.store.as_ref())?;
        Ok(BlobRef {
            area,
            len: bytes.len() as u64,
            kind,
        })
    }

    /// Store a string out-of-line.
    pub fn put_text(&self, s: &str) -> Result<BlobRef> {
        self.put(BlobKind::Text, s.as_bytes())
    }

    /// Store a byte sequence out-of-line.
    pub fn put_binary(&self, bytes: &[u8]) -> Result<BlobRef> {
        self.put(BlobKind::Binary, bytes)
    }

    fn get(&self, r: &BlobRef) -> Result<Vec<u8>> {
        let mut area = self.store.get_area(r.area)?;
        let kind = BlobKind::from_u8(area.read_u8()?)?;
        if kind != r.kind {
            return Err(Error::Corruption(format!(
                "blob kind mismatch at {}: ref says {:?}, area says {:?}",
                r.area, r.kind, kind
            )));
        }
        Ok(area.read_bytes(r.len as usize)?.to_vec())
    }

    /// Dereference a text blob.
    pub fn get_text(&self, r: &BlobRef) -> Result<String> {
        let raw = self.get(r)?;
        String::from_utf8(raw)
            .map_err(|_| Error::Corruption(format!("invalid utf-8 in blob {}", r.area)))
    }

    /// Dereference a binary blob.
    pub fn get_binary(&self, r: &BlobRef) -> Result<Vec<u8>> {
        self.get(r)
    }

    /// Release the blob's area. Called by row GC.
    pub fn free(&self, r: &BlobRef) -> Result<()> {
        self.store.delete_area(r.area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HeapStore;

    fn blob_store() -> BlobStore {
        BlobStore::new(Arc::new(HeapStore::new()))
    }

    #[test]
    fn test_text_roundtrip() {
        let blobs = blob_store();
        let r = blobs.put_text("a long string lives here").unwrap();
        assert_eq!(r.kind, BlobKind::Text);
        assert_eq!(blobs.get_text(&r).unwrap(), "a long string lives here");
    }

    #[test]
    fn test_binary_roundtrip() {
        let blobs = blob_store();
        let payload: Vec<u8> = (0..=255).collect();
        let r = blobs.put_binary(&payload).unwrap();
        assert_eq!(r.len, 256);
        assert_eq!(blobs.get_binary(&r).unwrap(), payload);
    }

    #[test]
    fn test_ref_encoding_roundtrip() {
        let blobs = blob_store();
        let r = blobs.put_text("x").unwrap();
        let mut buf = Vec::new();
        r.encode_to(&mut buf);
        assert_eq!(buf.len(), BLOB_REF_ENCODED_LEN);
        let mut pos = 0;
        assert_eq!(BlobRef::decode(&buf, &mut pos).unwrap(), r);
    }

    #[test]
    fn test_kind_mismatch_detected() {
        let blobs = blob_store();
        let mut r = blobs.put_text("abc").unwrap();
        r.kind = BlobKind::Binary;
        assert!(blobs.get(&r).is_err());
    }
}
