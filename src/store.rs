//! Two-phase vector store: concurrent loading, frozen serving
//!
//! Holds up to a fixed number of documents, each a single arena slab laid
//! out as `[embedding | id\0 | text\0 | metadata_json\0]` with the embedding
//! first and 64-byte aligned for the SIMD kernel.
//!
//! # Phases
//!
//! ```text
//! Loading ──(finalize: normalize all, publish)──▶ Serving
//! ```
//!
//! During Loading, any number of threads may call [`VectorStore::add_document`];
//! insertions are linearized by an atomic fetch-add on the entry count.
//! [`VectorStore::finalize`] is one-way and idempotent: it L2-normalizes every
//! embedding in parallel, then publishes the phase flag with sequentially
//! consistent ordering. Once a reader observes the flag it also observes every
//! entry and every normalized value. [`VectorStore::search`] refuses to run
//! before that publication.
//!
//! # Safety
//!
//! Entries hold raw pointers into arena memory owned by the store, so views
//! handed to callers borrow from the store and can never outlive it.

use std::borrow::Cow;
use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::arena::ArenaAllocator;
use crate::simd;

/// Default entry-table capacity (1M documents).
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// Alignment of every stored embedding: one cache line.
const EMBEDDING_ALIGN: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation illegal in the current phase (e.g. insert after finalize).
    #[error("store already finalized; documents can only be added during loading")]
    WrongPhase,

    /// Embedding array shorter than the declared dimension.
    #[error("embedding has {actual} values, store expects {expected}")]
    WrongDimension { expected: usize, actual: usize },

    /// Top-level shape or required-field types invalid.
    #[error("malformed document: {0}")]
    MalformedJson(String),

    /// Entry table full, embedding longer than the declared dimension, or a
    /// single slab larger than an arena chunk.
    #[error("capacity exceeded (limit {limit})")]
    Capacity { limit: usize },

    /// Arena could not satisfy the allocation.
    #[error("arena allocation failed")]
    OutOfMemory,
}

/// A document as decoded from its JSON representation.
///
/// `metadata` keeps the verbatim JSON text of the source `metadata` object
/// (embedding array included), so the stored copy round-trips byte-exactly.
#[derive(Deserialize)]
pub struct DocumentRecord<'a> {
    #[serde(borrow)]
    pub id: Cow<'a, str>,
    #[serde(borrow)]
    pub text: Cow<'a, str>,
    #[serde(borrow)]
    pub metadata: &'a RawValue,
}

/// Embedding extraction view over the metadata object. Unknown sibling
/// fields are ignored here but survive in the raw metadata text.
#[derive(Deserialize)]
struct EmbeddingField {
    embedding: Vec<f64>,
}

/// Borrowed view of a stored document.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    pub id: &'a str,
    pub text: &'a str,
    /// Verbatim JSON text of the source `metadata` object.
    pub metadata_json: &'a str,
}

/// One search result: cosine score plus the document's stable index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub score: f32,
    pub index: usize,
}

/// Byte-slice view into arena memory. The bytes are valid UTF-8 by
/// construction (they were copied out of decoded JSON strings).
#[derive(Clone, Copy)]
struct RawStr {
    ptr: *const u8,
    len: usize,
}

impl RawStr {
    const fn empty() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    /// SAFETY: caller must ensure `ptr` is either null (then `len` is 0 and
    /// the slot was never published) or points to `len` initialized UTF-8
    /// bytes that outlive the returned reference.
    unsafe fn as_str<'a>(&self) -> &'a str {
        if self.ptr.is_null() {
            return "";
        }
        std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr, self.len))
    }
}

/// One slot of the entry table.
struct RawEntry {
    /// Points at `dim` float32 values in arena memory; null while the slot
    /// is unpublished.
    embedding: *mut f32,
    id: RawStr,
    text: RawStr,
    metadata: RawStr,
}

impl RawEntry {
    const fn vacant() -> Self {
        Self {
            embedding: std::ptr::null_mut(),
            id: RawStr::empty(),
            text: RawStr::empty(),
            metadata: RawStr::empty(),
        }
    }
}

struct EntrySlot(UnsafeCell<RawEntry>);

// SAFETY: a slot is written exactly once, by the thread that reserved its
// index via fetch-add, and read by other threads only after the finalize
// publication (or by the writing thread itself). The phase protocol supplies
// the happens-before edge.
unsafe impl Sync for EntrySlot {}

/// In-process vector store answering exact top-k cosine queries.
///
/// See the module docs for the phase protocol. Construction fixes both the
/// embedding dimension and the entry capacity for the store's lifetime.
pub struct VectorStore {
    dim: usize,
    arena: ArenaAllocator,
    entries: Box<[EntrySlot]>,
    count: AtomicUsize,
    finalized: AtomicBool,
    finalize_once: Once,
    /// Serializes searches: each search already saturates the rayon pool, so
    /// overlapping calls would only fight over the same cores.
    search_lock: Mutex<()>,
}

// SAFETY: raw pointers in the entry table reference arena memory owned by
// this store; all cross-thread access follows the phase protocol described
// in the module docs.
unsafe impl Send for VectorStore {}
unsafe impl Sync for VectorStore {}

impl VectorStore {
    /// Create a store for embeddings of `dim` float32 values, pre-sized for
    /// [`DEFAULT_CAPACITY`] documents.
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, DEFAULT_CAPACITY)
    }

    /// Create a store with an explicit entry-table capacity.
    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        let entries: Box<[EntrySlot]> = (0..capacity)
            .map(|_| EntrySlot(UnsafeCell::new(RawEntry::vacant())))
            .collect();
        Self {
            dim,
            arena: ArenaAllocator::new(),
            entries,
            count: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            finalize_once: Once::new(),
            search_lock: Mutex::new(()),
        }
    }

    /// Embedding dimension declared at construction.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Maximum number of documents this store can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of successfully inserted documents.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`finalize`](Self::finalize) has completed.
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Insert one decoded document. Thread-safe during the Loading phase.
    ///
    /// Returns the document's stable index. The embedding array inside
    /// `metadata` must hold exactly `dim` values, each finite after the
    /// f64→f32 cast. Duplicate ids are accepted as-is; uniqueness belongs to
    /// a validating layer above the engine.
    pub fn add_document(&self, doc: &DocumentRecord<'_>) -> Result<usize, StoreError> {
        if self.is_finalized() {
            return Err(StoreError::WrongPhase);
        }

        let embedding = self.decode_embedding(doc.metadata.get())?;

        let id = doc.id.as_bytes();
        let text = doc.text.as_bytes();
        let metadata = doc.metadata.get().as_bytes();

        let emb_bytes = self.dim * std::mem::size_of::<f32>();
        let total = emb_bytes + id.len() + 1 + text.len() + 1 + metadata.len() + 1;

        // A slab can never span chunks; reject oversize documents up front
        // so OutOfMemory is left for genuine allocation failure.
        if total > self.arena.chunk_size() {
            return Err(StoreError::Capacity {
                limit: self.arena.chunk_size(),
            });
        }

        let base = self
            .arena
            .allocate(total, EMBEDDING_ALIGN)
            .ok_or(StoreError::OutOfMemory)?;

        // Slab layout: [embedding][id\0][text\0][metadata\0]. The slab was
        // committed before the slot is reserved, so a published index always
        // refers to fully written memory.
        let (emb_ptr, id_str, text_str, meta_str) = unsafe {
            let emb_ptr = base.as_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(embedding.as_ptr(), emb_ptr, self.dim);

            let id_ptr = base.as_ptr().add(emb_bytes);
            let text_ptr = id_ptr.add(id.len() + 1);
            let meta_ptr = text_ptr.add(text.len() + 1);

            write_nul_terminated(id_ptr, id);
            write_nul_terminated(text_ptr, text);
            write_nul_terminated(meta_ptr, metadata);

            (
                emb_ptr,
                RawStr { ptr: id_ptr, len: id.len() },
                RawStr { ptr: text_ptr, len: text.len() },
                RawStr { ptr: meta_ptr, len: metadata.len() },
            )
        };

        let index = self.count.fetch_add(1, Ordering::Relaxed);
        if index >= self.entries.len() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Err(StoreError::Capacity {
                limit: self.entries.len(),
            });
        }

        // SAFETY: the fetch-add handed this index to us exclusively; nobody
        // else writes this slot, and readers wait for the finalize fence.
        unsafe {
            *self.entries[index].0.get() = RawEntry {
                embedding: emb_ptr,
                id: id_str,
                text: text_str,
                metadata: meta_str,
            };
        }

        Ok(index)
    }

    /// Parse and insert a single JSON document object.
    pub fn add_document_json(&self, json: &str) -> Result<usize, StoreError> {
        let record: DocumentRecord<'_> = serde_json::from_str(json)
            .map_err(|e| StoreError::MalformedJson(e.to_string()))?;
        self.add_document(&record)
    }

    /// Transition from Loading to Serving.
    ///
    /// The first caller L2-normalizes every embedding (in parallel, in
    /// place) and publishes the phase flag; embeddings with squared norm at
    /// or below [`simd::MIN_SQUARED_NORM`] keep their original values.
    /// Subsequent calls return immediately. Callers must have joined all
    /// inserting threads first; the engine does not fence in-flight inserts.
    pub fn finalize(&self) {
        self.finalize_once.call_once(|| {
            let n = self.count.load(Ordering::Acquire);

            (0..n).into_par_iter().for_each(|i| {
                // SAFETY: i < n was reserved by an insert; if its slab write
                // raced with this call the application broke the quiescence
                // contract, and the vacant null sentinel keeps us out of
                // unowned memory.
                let entry = unsafe { &mut *self.entries[i].0.get() };
                if entry.embedding.is_null() {
                    return;
                }
                let emb = unsafe { std::slice::from_raw_parts_mut(entry.embedding, self.dim) };
                simd::l2_normalize(emb);
            });

            // Publication point: everything above happens-before any reader
            // that observes `finalized == true`.
            self.finalized.store(true, Ordering::SeqCst);
        });
    }

    /// Exact top-k cosine search over every stored document.
    ///
    /// The query is treated as unit-length; normalize on the caller side
    /// with [`simd::l2_normalized`]. Returns the `min(k, len)` highest
    /// scores sorted descending, ties broken by ascending index. Empty
    /// before finalize, or when the store or `k` is empty.
    ///
    /// # Panics
    ///
    /// Panics if `query.len() != dim`.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if !self.is_finalized() {
            return Vec::new();
        }
        assert_eq!(query.len(), self.dim, "query dimension mismatch");

        let n = self.count.load(Ordering::Acquire);
        if n == 0 || k == 0 {
            return Vec::new();
        }
        let k = k.min(n);

        // One search already fans out across every core; running two at
        // once would just thrash the same pool.
        let _serialize = self.search_lock.lock();

        let merged = (0..n)
            .into_par_iter()
            .fold(
                || TopK::new(k),
                |mut heap, i| {
                    // SAFETY: i < count and the store is finalized, so the
                    // slot is published and immutable.
                    let entry = unsafe { &*self.entries[i].0.get() };
                    if !entry.embedding.is_null() {
                        let emb = unsafe {
                            std::slice::from_raw_parts(entry.embedding as *const f32, self.dim)
                        };
                        heap.push(simd::dot_product(query, emb), i);
                    }
                    heap
                },
            )
            .reduce(|| TopK::new(k), TopK::merge);

        merged.into_sorted_hits()
    }

    /// Borrow a stored document by index.
    ///
    /// Indices come from [`SearchHit::index`] or [`add_document`](Self::add_document).
    /// Cross-thread reads are only well-defined once the store is finalized.
    pub fn get_document(&self, index: usize) -> Option<Document<'_>> {
        if index >= self.len() {
            return None;
        }
        // SAFETY: index < count, so the slot was published by an insert.
        let entry = unsafe { &*self.entries[index].0.get() };
        if entry.embedding.is_null() {
            return None;
        }
        // SAFETY: the RawStr views point into this store's arena, which
        // outlives the returned borrow.
        unsafe {
            Some(Document {
                id: entry.id.as_str(),
                text: entry.text.as_str(),
                metadata_json: entry.metadata.as_str(),
            })
        }
    }

    /// Borrow a stored embedding by index (normalized once Serving).
    pub fn embedding(&self, index: usize) -> Option<&[f32]> {
        if index >= self.len() {
            return None;
        }
        // SAFETY: as in `get_document`.
        let entry = unsafe { &*self.entries[index].0.get() };
        if entry.embedding.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(entry.embedding as *const f32, self.dim) })
    }

    /// Extract the embedding array from the raw metadata JSON and validate
    /// arity and float32 range.
    fn decode_embedding(&self, metadata_json: &str) -> Result<Vec<f32>, StoreError> {
        let field: EmbeddingField = serde_json::from_str(metadata_json)
            .map_err(|e| StoreError::MalformedJson(format!("metadata.embedding: {e}")))?;

        let values = field.embedding;
        if values.len() < self.dim {
            return Err(StoreError::WrongDimension {
                expected: self.dim,
                actual: values.len(),
            });
        }
        if values.len() > self.dim {
            return Err(StoreError::Capacity { limit: self.dim });
        }

        let mut out = Vec::with_capacity(self.dim);
        for (j, v) in values.into_iter().enumerate() {
            let f = v as f32;
            if !f.is_finite() {
                return Err(StoreError::MalformedJson(format!(
                    "embedding value at index {j} is outside the finite float32 range"
                )));
            }
            out.push(f);
        }
        Ok(out)
    }
}

/// Copy `bytes` to `dst` and append a NUL terminator.
///
/// SAFETY: caller must own `bytes.len() + 1` writable bytes at `dst`.
#[inline]
unsafe fn write_nul_terminated(dst: *mut u8, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    *dst.add(bytes.len()) = 0;
}

// ============================================================================
// Bounded top-k selection
// ============================================================================

/// Search candidate ordered by score, then by index so equal scores rank
/// the lower index first. The order is total for the finite scores the
/// store produces (NaN collapses to Equal and is tie-broken by index).
#[derive(Clone, Copy)]
struct Candidate {
    score: f32,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Per-worker bounded min-heap holding the k best candidates seen so far.
///
/// The root is the weakest survivor; a new candidate only enters by beating
/// it. Workers fill private heaps and the reduce step merges them, so the
/// hot loop never contends on shared state.
struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn push(&mut self, score: f32, index: usize) {
        self.insert(Candidate { score, index });
    }

    fn insert(&mut self, candidate: Candidate) {
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
        } else if let Some(Reverse(weakest)) = self.heap.peek() {
            if candidate > *weakest {
                self.heap.pop();
                self.heap.push(Reverse(candidate));
            }
        }
    }

    fn merge(mut self, other: TopK) -> TopK {
        for Reverse(candidate) in other.heap {
            self.insert(candidate);
        }
        self
    }

    fn into_sorted_hits(self) -> Vec<SearchHit> {
        let mut candidates: Vec<Candidate> = self.heap.into_iter().map(|r| r.0).collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates
            .into_iter()
            .map(|c| SearchHit {
                score: c.score,
                index: c.index,
            })
            .collect()
    }
}
