//! Component H: opaque blob storage for DNSSEC key material.
//!
//! The original stores these blobs as chains of fixed-size chunks and
//! keeps a free list of chunks released by `blockdata_free`, consuming it
//! before reaching for a fresh allocation — the workload is long-lived
//! keys churning in and out of a cache, and a free list keeps that from
//! being a steady stream of `malloc`/`free` calls. We keep the same
//! shape: a [`BlockStore`] owns the free list, and [`BlockData`] is the
//! cheaply-clonable handle `alloc` hands back.

use std::sync::{Arc, Mutex};

/// Bytes per chunk. The original's `KEYBLOCK_LEN` is 40; kept the same so
/// behaviour around chunk-boundary edge cases (a blob exactly N chunks
/// long) still exercises the same boundary as the system being modeled.
pub const KEYBLOCK_LEN: usize = 40;

/// An opaque, immutable blob, stored as a chain of fixed-size chunks
/// under one `Arc` so cloning a handle is cheap and never copies data.
#[derive(Debug, Clone)]
pub struct BlockData {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    chunks: Vec<[u8; KEYBLOCK_LEN]>,
    len: usize,
}

impl BlockData {
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Reassembles the original bytes, mirroring `blockdata_retrieve`.
    pub fn retrieve(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.inner.len);
        for chunk in &self.inner.chunks {
            let remaining = self.inner.len - out.len();
            let take = remaining.min(KEYBLOCK_LEN);
            out.extend_from_slice(&chunk[..take]);
        }
        out
    }

    /// Walks chunk-by-chunk without reassembling, mirroring
    /// `blockdata_walk`. Useful for callers that want to checksum or
    /// compare a blob without paying for a full copy.
    pub fn walk(&self) -> impl Iterator<Item = &[u8]> {
        let total = self.inner.len;
        self.inner.chunks.iter().enumerate().map(move |(i, chunk)| {
            let consumed = i * KEYBLOCK_LEN;
            let remaining = total.saturating_sub(consumed);
            let take = remaining.min(KEYBLOCK_LEN);
            &chunk[..take]
        })
    }

    /// Number of references sharing these chunks.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Owns the free list of released chunks. `alloc` draws from it before
/// allocating fresh chunks; `free` returns a blob's chunks to it once the
/// caller is done, but only once every clone of that blob has been
/// dropped too.
#[derive(Debug, Default)]
pub struct BlockStore {
    free: Mutex<Vec<[u8; KEYBLOCK_LEN]>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }

    /// Number of chunks currently sitting in the free list, available for
    /// reuse by the next `alloc`.
    pub fn free_chunks(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Splits `data` into `KEYBLOCK_LEN`-byte chunks, consuming up to
    /// `⌈data.len() / KEYBLOCK_LEN⌉` chunks from the free list before
    /// allocating any new ones, mirroring `blockdata_alloc`'s walk over
    /// its own free list. A chunk drawn from the free list has its unused
    /// tail explicitly zeroed so no previous blob's bytes leak into this
    /// one.
    pub fn alloc(&self, data: &[u8]) -> BlockData {
        let mut free = self.free.lock().unwrap();
        let mut chunks = Vec::with_capacity(data.len() / KEYBLOCK_LEN + 1);
        for piece in data.chunks(KEYBLOCK_LEN) {
            let mut block = free.pop().unwrap_or([0u8; KEYBLOCK_LEN]);
            block[..piece.len()].copy_from_slice(piece);
            block[piece.len()..].fill(0);
            chunks.push(block);
        }
        drop(free);
        BlockData {
            inner: Arc::new(Inner { chunks, len: data.len() }),
        }
    }

    /// Releases `blob`'s chunks to the free list for the next `alloc` to
    /// reuse. If another clone of `blob` is still alive, the chunks are
    /// still shared and nothing is released; returns whether the chunks
    /// were actually reclaimed.
    pub fn free(&self, blob: BlockData) -> bool {
        match Arc::try_unwrap(blob.inner) {
            Ok(inner) => {
                self.free.lock().unwrap().extend(inner.chunks);
                true
            }
            Err(_still_shared) => false,
        }
    }
}
