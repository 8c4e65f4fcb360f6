//! Embedstore – In-process exact top-k cosine similarity over dense embeddings
//!
//! The retrieval layer of a RAG service: ingest JSON document files from a
//! directory, hold each document's id, text, metadata, and float32 embedding
//! in cache-dense arena memory, and answer exact top-k cosine queries over
//! the full corpus in single-digit milliseconds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Directory Loader (producer/consumer)           │
//! │        sequential I/O + mmap · parallel JSON decode         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          VectorStore (Loading → Serving phases)             │
//! │    concurrent insert · one-shot normalize · parallel top-k  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           ArenaAllocator (64 MiB chunks, CAS bump)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use embedstore::{load_directory, LoaderConfig, VectorStore};
//!
//! let store = VectorStore::new(768);
//! let stats = load_directory(&store, "corpus/", &LoaderConfig::default()).unwrap();
//! println!("{} docs in {:.1}s", stats.documents_parsed, stats.elapsed.as_secs_f64());
//!
//! let query = embedstore::simd::l2_normalized(&vec![0.1; 768]);
//! for hit in store.search(&query, 10) {
//!     let doc = store.get_document(hit.index).unwrap();
//!     println!("{:.4} {}", hit.score, doc.id);
//! }
//! ```
//!
//! The engine is search-only after [`VectorStore::finalize`]: no deletes, no
//! re-indexing, no persistence. Queries are expected to be unit-length; use
//! [`simd::l2_normalized`] on the caller side.

mod arena;
pub mod loader;
pub mod simd;
pub mod store;

pub use loader::{load_directory, load_file, LoaderConfig, LoaderError, LoaderStats};
pub use store::{Document, DocumentRecord, SearchHit, StoreError, VectorStore};
