//! Memory-mapped file handle for the loader's work items
//!
//! Small JSON files go through the page cache instead of read+copy; the
//! mapping lives inside the work item and is unmapped when the item drops,
//! on every exit path.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;

/// Read-only memory mapping of a whole file.
pub(crate) struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    /// Map `path` read-only and advise sequential access.
    ///
    /// Fails for empty files (a zero-length mapping is not representable);
    /// the loader falls back to standard I/O on any error here.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        // SAFETY: the mapping is read-only and private; a concurrent
        // truncation of the underlying file could still fault, which is the
        // documented caveat of mapping files we do not own exclusively.
        let map = unsafe { Mmap::map(&file)? };

        #[cfg(unix)]
        let _ = map.advise(memmap2::Advice::Sequential);

        Ok(Self { map })
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }
}
