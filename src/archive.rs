//! Archive accessor seam.
//!
//! The device already owns a streaming ZIP reader; this crate only needs two
//! things from it: the inflated size of an entry, and a chunked copy of an
//! entry's decompressed bytes into a sink. [`ArchiveAccessor`] captures that
//! contract so the pipeline can be driven by the real inflater on device and
//! by [`MemoryArchive`] in host tests.
//!
//! Paths handed to an accessor must be normalized first (see
//! [`normalize_path`]): hrefs in package documents routinely contain `./`
//! and `../` segments relative to the package base directory.

use std::io::Write;

use crate::error::BookbinError;

/// Default chunk size for streaming reads.
///
/// Chunking is a hard memory invariant, not a tuning knob: peak RAM while
/// parsing must not scale with archive or document size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Read access to an EPUB archive (a ZIP file), provided by the platform.
pub trait ArchiveAccessor {
    /// Inflated (decompressed) size of the entry at `path`.
    ///
    /// Fails with [`BookbinError::NotFound`] when the entry is absent.
    fn inflated_size(&mut self, path: &str) -> Result<u64, BookbinError>;

    /// Stream the decompressed bytes of `path` into `sink` in chunks of at
    /// most `chunk_size` bytes. Returns the total byte count written.
    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn Write,
        chunk_size: usize,
    ) -> Result<u64, BookbinError>;
}

/// Resolve `.` and `..` segments and collapse duplicate slashes.
///
/// Produces the canonical in-archive form: forward slashes, no leading
/// slash. `..` at the root is dropped rather than escaping the archive.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// In-memory [`ArchiveAccessor`] holding pre-inflated entries.
///
/// Entry lookup is a linear scan over the entry list, matching the
/// sequential-access discipline of the on-device reader.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    entries: Vec<(String, Vec<u8>)>,
}

impl MemoryArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry under its canonical in-archive path.
    pub fn insert(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        self.entries
            .push((normalize_path(path), content.into()));
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_entry(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    fn find(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, data)| data.as_slice())
    }
}

impl ArchiveAccessor for MemoryArchive {
    fn inflated_size(&mut self, path: &str) -> Result<u64, BookbinError> {
        self.find(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| BookbinError::NotFound(format!("archive entry: {}", path)))
    }

    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn Write,
        chunk_size: usize,
    ) -> Result<u64, BookbinError> {
        let data = self
            .find(path)
            .ok_or_else(|| BookbinError::NotFound(format!("archive entry: {}", path)))?
            .to_vec();
        let chunk_size = chunk_size.max(1);
        for chunk in data.chunks(chunk_size) {
            sink.write_all(chunk)?;
        }
        Ok(data.len() as u64)
    }
}
