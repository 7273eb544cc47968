//! The hub treats a room's CRDT document as an opaque collaborator: it
//! only ever applies update blobs and reads back full-state / state-vector
//! bytes. Implementing an actual CRDT (Yjs-style, Automerge-style, ...) is
//! explicitly out of scope — this module provides the one seam a real
//! implementation would plug into, plus a minimal implementation that
//! satisfies the contract so the rest of the hub (cache, persistence,
//! resume-from-snapshot) has something concrete to run against.

use anyhow::{bail, Context};

/// Opaque CRDT state: accepts binary updates, and can be serialized to a
/// full-state byte string and to a state-vector byte string. Merges are
/// commutative, associative, and idempotent — the hub never relies on
/// anything beyond that.
pub trait CrdtDocument: Send + Sync {
    /// Feed an opaque update blob into the document.
    fn apply(&mut self, update: &[u8]);

    /// Serialize the full current state.
    fn encode_full(&self) -> Vec<u8>;

    /// Serialize a compact state-vector summary of the current state.
    fn state_vector(&self) -> Vec<u8>;

    /// Replace the document's state by loading a previously-`encode_full`'d
    /// payload (e.g. the newest persisted snapshot). Fails if the payload is
    /// not a well-formed encoding, which the cache treats as a room-local
    /// Document failure.
    fn load_full(&mut self, payload: &[u8]) -> anyhow::Result<()>;

    /// Whether any update has been applied since the last `load_full`.
    fn is_empty(&self) -> bool;
}

pub fn new_document() -> Box<dyn CrdtDocument> {
    Box::new(OpaqueLogDocument::new())
}

/// A document modeled as the ordered log of applied update blobs. This is
/// deliberately not a real CRDT merge algorithm: `encode_full` is simply a
/// length-prefixed concatenation of the log, and `load_full` is its
/// inverse, so `load_full(encode_full(x))` always reproduces an equivalent
/// document regardless of what the opaque update bytes actually mean. That
/// is exactly the boundary spec.md draws around the CRDT — the hub never
/// looks inside `update`.
#[derive(Debug, Default)]
pub struct OpaqueLogDocument {
    updates: Vec<Vec<u8>>,
}

impl OpaqueLogDocument {
    pub fn new() -> Self {
        Self { updates: Vec::new() }
    }
}

impl CrdtDocument for OpaqueLogDocument {
    fn apply(&mut self, update: &[u8]) {
        self.updates.push(update.to_vec());
    }

    fn encode_full(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.updates.iter().map(|u| 4 + u.len()).sum::<usize>());
        buf.extend_from_slice(&(self.updates.len() as u32).to_le_bytes());
        for update in &self.updates {
            buf.extend_from_slice(&(update.len() as u32).to_le_bytes());
            buf.extend_from_slice(update);
        }
        buf
    }

    fn state_vector(&self) -> Vec<u8> {
        (self.updates.len() as u64).to_le_bytes().to_vec()
    }

    fn load_full(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.is_empty() {
            self.updates = Vec::new();
            return Ok(());
        }
        let mut cursor = 0usize;
        let count = read_u32(payload, &mut cursor).context("truncated document header")?;
        let mut updates = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u32(payload, &mut cursor).context("truncated update length")? as usize;
            if cursor + len > payload.len() {
                bail!("truncated update body");
            }
            updates.push(payload[cursor..cursor + len].to_vec());
            cursor += len;
        }
        if cursor != payload.len() {
            bail!("trailing bytes after document log");
        }
        self.updates = updates;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> anyhow::Result<u32> {
    if *cursor + 4 > buf.len() {
        bail!("buffer too short");
    }
    let bytes: [u8; 4] = buf[*cursor..*cursor + 4].try_into().unwrap();
    *cursor += 4;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_and_load() {
        let mut doc = OpaqueLogDocument::new();
        doc.apply(b"AAEC");
        doc.apply(b"hello world");

        let encoded = doc.encode_full();
        let mut fresh = OpaqueLogDocument::new();
        fresh.load_full(&encoded).unwrap();

        assert_eq!(fresh.encode_full(), encoded);
        assert!(!fresh.is_empty());
    }

    #[test]
    fn empty_document_round_trips() {
        let doc = OpaqueLogDocument::new();
        let encoded = doc.encode_full();
        let mut fresh = OpaqueLogDocument::new();
        fresh.load_full(&encoded).unwrap();
        assert!(fresh.is_empty());
        assert_eq!(fresh.encode_full(), encoded);
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut doc = OpaqueLogDocument::new();
        doc.apply(b"partial");
        let mut encoded = doc.encode_full();
        encoded.truncate(encoded.len() - 1);

        let mut fresh = OpaqueLogDocument::new();
        assert!(fresh.load_full(&encoded).is_err());
    }
}
