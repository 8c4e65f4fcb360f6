//! Adaptive parallel directory loader
//!
//! Turns a directory of `.json` files into [`VectorStore`] inserts, then
//! finalizes the store. One producer thread walks the sorted file list and
//! performs all the sequential I/O; a pool of consumer threads decodes JSON
//! and inserts documents in parallel. A bounded channel between them caps
//! buffered file data and gives the producer backpressure.
//!
//! ```text
//! producer ──(bounded queue of file payloads)──▶ consumer × N ──▶ store
//! ```
//!
//! # Adaptive I/O
//!
//! Files below the mmap threshold are memory mapped: for many small files
//! this skips the per-file allocate-and-copy and lets the page cache do the
//! work. Larger files are read into a buffer the producer reuses across
//! files, which beats faulting a big mapping in page by page. The 5 MiB
//! default threshold came out of benchmarking the two strategies against
//! each other on real corpora.
//!
//! # Failure policy
//!
//! Everything recoverable recovers locally: an unreadable or unparseable
//! file is logged and skipped, a malformed document inside an array is
//! logged and skipped, an insert rejection is logged and counted. Only
//! directory enumeration failure surfaces as an error, and even then the
//! store is finalized first so it can serve whatever did load.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{DocumentRecord, VectorStore};

mod mmap;
use mmap::MappedFile;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tuning knobs for [`load_directory`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Bounded capacity of the producer/consumer queue.
    pub queue_capacity: usize,
    /// Number of parsing threads; 0 means one per hardware thread,
    /// clamped to the file count.
    pub consumer_threads: usize,
    /// Files strictly smaller than this are memory mapped.
    pub mmap_threshold_bytes: u64,
    /// When false, every file goes through standard I/O.
    pub use_adaptive_loading: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            consumer_threads: 0,
            mmap_threshold_bytes: 5 * 1024 * 1024,
            use_adaptive_loading: true,
        }
    }
}

/// What a load run did, returned by [`load_directory`].
#[derive(Debug, Clone, Default)]
pub struct LoaderStats {
    /// `.json` files found in the directory.
    pub total_files: u64,
    /// Files that contributed at least one document.
    pub files_loaded: u64,
    /// Files skipped for I/O or parse failures, or with no usable document.
    pub files_failed: u64,
    /// Files delivered through memory mapping.
    pub mmap_files: u64,
    /// Files delivered through standard reads.
    pub standard_files: u64,
    /// Total size of the files the producer picked up.
    pub bytes_processed: u64,
    /// Documents successfully inserted into the store.
    pub documents_parsed: u64,
    /// Documents dropped by validation or per-document parse failures.
    pub documents_rejected: u64,
    /// Wall-clock duration of the whole run.
    pub elapsed: Duration,
}

impl LoaderStats {
    pub fn documents_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.documents_parsed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn megabytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_processed as f64 / (1024.0 * 1024.0)) / secs
        } else {
            0.0
        }
    }
}

/// Cross-thread tally, snapshotted into [`LoaderStats`] at the end.
#[derive(Default)]
struct Counters {
    files_loaded: AtomicU64,
    files_failed: AtomicU64,
    mmap_files: AtomicU64,
    standard_files: AtomicU64,
    bytes_processed: AtomicU64,
    documents_parsed: AtomicU64,
    documents_rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self, total_files: u64, elapsed: Duration) -> LoaderStats {
        LoaderStats {
            total_files,
            files_loaded: self.files_loaded.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            mmap_files: self.mmap_files.load(Ordering::Relaxed),
            standard_files: self.standard_files.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            documents_parsed: self.documents_parsed.load(Ordering::Relaxed),
            documents_rejected: self.documents_rejected.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// One file's payload travelling from producer to consumer. Dropping the
/// item releases the mapping or the owned buffer.
enum WorkItem {
    Mapped { path: PathBuf, map: MappedFile },
    Owned { path: PathBuf, bytes: Vec<u8> },
}

impl WorkItem {
    fn path(&self) -> &Path {
        match self {
            WorkItem::Mapped { path, .. } | WorkItem::Owned { path, .. } => path,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            WorkItem::Mapped { map, .. } => map.bytes(),
            WorkItem::Owned { bytes, .. } => bytes,
        }
    }
}

/// Load every `.json` file in `dir` (non-recursive) into `store`, then
/// finalize it.
///
/// Files are visited in lexicographic path order so runs are reproducible.
/// The store is finalized on every exit path, including the empty-directory
/// and enumeration-failure cases.
pub fn load_directory<P: AsRef<Path>>(
    store: &VectorStore,
    dir: P,
    config: &LoaderConfig,
) -> Result<LoaderStats, LoaderError> {
    let start = Instant::now();

    let files = match find_json_files(dir.as_ref()) {
        Ok(files) => files,
        Err(err) => {
            // Serve whatever made it in (nothing) and report the failure.
            store.finalize();
            return Err(err);
        }
    };

    let counters = Counters::default();

    if files.is_empty() {
        store.finalize();
        return Ok(counters.snapshot(0, start.elapsed()));
    }

    let consumer_threads = effective_consumers(config, files.len());
    let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(config.queue_capacity.max(1));

    std::thread::scope(|scope| {
        {
            let files = &files[..];
            let counters = &counters;
            scope.spawn(move || run_producer(files, tx, counters, config));
        }
        for _ in 0..consumer_threads {
            let rx = rx.clone();
            let counters = &counters;
            scope.spawn(move || run_consumer(store, rx, counters));
        }
    });

    store.finalize();
    Ok(counters.snapshot(files.len() as u64, start.elapsed()))
}

/// Load a single JSON file (document object or array of objects) without
/// finalizing the store. Returns the number of documents inserted.
///
/// Parse and validation failures inside the file are logged and skipped
/// exactly as in [`load_directory`]; only I/O errors propagate.
pub fn load_file<P: AsRef<Path>>(store: &VectorStore, path: P) -> Result<usize, LoaderError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let counters = Counters::default();
    parse_file(store, path, &bytes, &counters);
    Ok(counters.documents_parsed.load(Ordering::Relaxed) as usize)
}

/// Collect regular `.json` files in `dir`, sorted for deterministic order.
fn find_json_files(dir: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "json") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn effective_consumers(config: &LoaderConfig, file_count: usize) -> usize {
    let requested = if config.consumer_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        config.consumer_threads
    };
    requested.min(file_count).max(1)
}

/// Sequentially read (or map) every file and feed the queue. Sole owner of
/// the disk: consumers never touch the filesystem.
fn run_producer(
    files: &[PathBuf],
    tx: Sender<WorkItem>,
    counters: &Counters,
    config: &LoaderConfig,
) {
    // Reusable read buffer; grows to the largest standard-I/O file and
    // stays there for the rest of the run.
    let mut buffer: Vec<u8> = Vec::with_capacity(1 << 20);

    for path in files {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(file = %path.display(), %err, "failed to stat file, skipping");
                counters.files_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        counters.bytes_processed.fetch_add(size, Ordering::Relaxed);

        let mapped = if config.use_adaptive_loading && size < config.mmap_threshold_bytes {
            match MappedFile::open(path) {
                Ok(map) => Some(map),
                Err(err) => {
                    debug!(file = %path.display(), %err, "mmap failed, using standard I/O");
                    None
                }
            }
        } else {
            None
        };

        let item = match mapped {
            Some(map) => {
                counters.mmap_files.fetch_add(1, Ordering::Relaxed);
                WorkItem::Mapped {
                    path: path.clone(),
                    map,
                }
            }
            None => match read_standard(path, &mut buffer) {
                Ok(bytes) => {
                    counters.standard_files.fetch_add(1, Ordering::Relaxed);
                    WorkItem::Owned {
                        path: path.clone(),
                        bytes,
                    }
                }
                Err(err) => {
                    warn!(file = %path.display(), %err, "failed to read file, skipping");
                    counters.files_failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            },
        };

        // Blocks while the queue is full: this is the memory backpressure.
        // A send error means every consumer is gone, so stop producing.
        if tx.send(item).is_err() {
            break;
        }
    }
    // Dropping `tx` disconnects the channel; consumers drain and exit.
}

/// Read a whole file through the reusable buffer, then hand back an owned
/// copy sized to the content.
fn read_standard(path: &Path, buffer: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    buffer.clear();
    file.read_to_end(buffer)?;
    Ok(buffer.clone())
}

/// Decode queued files and insert their documents until the queue drains
/// and the producer hangs up.
fn run_consumer(store: &VectorStore, rx: Receiver<WorkItem>, counters: &Counters) {
    for item in rx {
        if parse_file(store, item.path(), item.bytes(), counters) {
            counters.files_loaded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.files_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Parse one file's bytes and insert every valid document. Returns true if
/// at least one document made it into the store.
///
/// The file may hold a single document object or an array of them; the
/// shape is detected from the first non-whitespace byte. Array elements are
/// decoded individually so one malformed sibling cannot sink the rest.
fn parse_file(store: &VectorStore, path: &Path, bytes: &[u8], counters: &Counters) -> bool {
    let Some(first) = bytes.iter().copied().find(|b| !b.is_ascii_whitespace()) else {
        warn!(file = %path.display(), "file is empty");
        return false;
    };

    let mut added = 0usize;
    if first == b'[' {
        let elements: Vec<&RawValue> = match serde_json::from_slice(bytes) {
            Ok(elements) => elements,
            Err(err) => {
                warn!(file = %path.display(), %err, "failed to parse JSON array");
                return false;
            }
        };
        for (position, raw) in elements.iter().enumerate() {
            match serde_json::from_str::<DocumentRecord<'_>>(raw.get()) {
                Ok(record) => {
                    if insert_document(store, &record, path, position, counters) {
                        added += 1;
                    }
                }
                Err(err) => {
                    warn!(file = %path.display(), position, %err, "skipping malformed document");
                    counters.documents_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    } else {
        match serde_json::from_slice::<DocumentRecord<'_>>(bytes) {
            Ok(record) => {
                if insert_document(store, &record, path, 0, counters) {
                    added += 1;
                }
            }
            Err(err) => {
                warn!(file = %path.display(), %err, "failed to parse document");
                return false;
            }
        }
    }

    added > 0
}

fn insert_document(
    store: &VectorStore,
    record: &DocumentRecord<'_>,
    path: &Path,
    position: usize,
    counters: &Counters,
) -> bool {
    match store.add_document(record) {
        Ok(_) => {
            counters.documents_parsed.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(err) => {
            warn!(file = %path.display(), position, %err, "document rejected");
            counters.documents_rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_find_json_files_sorted_non_recursive() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "b.json", "{}");
        write_file(dir.path(), "a.json", "{}");
        write_file(dir.path(), "notes.txt", "ignored");
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_file(&dir.path().join("nested"), "c.json", "{}");

        let files = find_json_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn test_find_json_files_missing_dir() {
        let result = find_json_files(Path::new("/nonexistent/corpus"));
        assert!(matches!(result, Err(LoaderError::Io(_))));
    }

    #[test]
    fn test_effective_consumers_clamped() {
        let mut config = LoaderConfig::default();
        config.consumer_threads = 8;
        assert_eq!(effective_consumers(&config, 3), 3);
        assert_eq!(effective_consumers(&config, 100), 8);

        config.consumer_threads = 0;
        assert!(effective_consumers(&config, 1000) >= 1);
        assert_eq!(effective_consumers(&config, 1), 1);
    }

    #[test]
    fn test_stats_derived_metrics() {
        let stats = LoaderStats {
            documents_parsed: 500,
            bytes_processed: 10 * 1024 * 1024,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert!((stats.documents_per_second() - 250.0).abs() < 1e-9);
        assert!((stats.megabytes_per_second() - 5.0).abs() < 1e-9);

        let empty = LoaderStats::default();
        assert_eq!(empty.documents_per_second(), 0.0);
        assert_eq!(empty.megabytes_per_second(), 0.0);
    }
}
