//! Block storage abstraction.
//!
//! The pipeline's scratch files and the finished index live on a persistent
//! block-storage card. On device that card is an SD-class filesystem; on the
//! host it is a plain directory. Everything the builder and reader need is a
//! handful of sequential-file operations, captured by [`BlockStorage`].
//!
//! Handles are plain `Read + Seek` / `Write + Seek` values. The pipeline is
//! single-threaded and each phase closes its handles (by dropping them)
//! before the next phase reopens the same file, so no locking discipline is
//! needed beyond that.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Storage backend consumed by the index builder, reader, and orchestrator.
pub trait BlockStorage {
    /// Sequential read handle with seek support.
    type Reader: Read + Seek;
    /// Sequential write handle with seek support.
    type Writer: Write + Seek;

    /// Open an existing file for reading. Fails with `NotFound` if absent.
    fn open_read(&self, path: &str) -> io::Result<Self::Reader>;

    /// Open a file for writing, creating it if needed.
    ///
    /// With `truncate` the file is emptied; without it existing content is
    /// kept and the cursor starts at offset 0.
    fn open_write(&self, path: &str, truncate: bool) -> io::Result<Self::Writer>;

    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// Remove a single file.
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Atomically rename `from` to `to`, replacing any existing file.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Create a directory and any missing parents.
    fn create_dir_all(&self, path: &str) -> io::Result<()>;

    /// Remove a directory and everything under it.
    fn remove_dir_all(&self, path: &str) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Filesystem-backed storage
// ---------------------------------------------------------------------------

/// [`BlockStorage`] backed by a directory on the host filesystem.
///
/// Storage paths are slash-separated and resolved relative to `root`; a
/// leading slash is accepted and ignored so device-style absolute paths
/// (`/cache/...`) work unchanged.
#[derive(Clone, Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create a storage backend rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl BlockStorage for FsStorage {
    type Reader = File;
    type Writer = File;

    fn open_read(&self, path: &str) -> io::Result<File> {
        File::open(self.resolve(path))
    }

    fn open_write(&self, path: &str, truncate: bool) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(self.resolve(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn create_dir_all(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn remove_dir_all(&self, path: &str) -> io::Result<()> {
        fs::remove_dir_all(self.resolve(path))
    }
}

// ---------------------------------------------------------------------------
// In-memory storage (host-side tests, synthetic books)
// ---------------------------------------------------------------------------

type FileTable = Rc<RefCell<Vec<(String, Vec<u8>)>>>;

/// In-memory [`BlockStorage`] with a flat file table.
///
/// Directories are implicit: `create_dir_all` is a no-op and
/// `remove_dir_all` drops every file under the prefix. Intended for tests;
/// the device uses the filesystem card.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    files: FileTable,
}

impl MemoryStorage {
    /// Create an empty in-memory storage backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored (test introspection).
    pub fn file_count(&self) -> usize {
        self.files.borrow().len()
    }

    fn normalize(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn index_of(&self, path: &str) -> Option<usize> {
        let path = Self::normalize(path);
        self.files.borrow().iter().position(|(name, _)| *name == path)
    }
}

/// Open handle into a [`MemoryStorage`] file.
///
/// Reads and writes go straight through to the shared file table, mirroring
/// unbuffered device file handles.
#[derive(Debug)]
pub struct MemoryHandle {
    files: FileTable,
    name: String,
    pos: u64,
}

impl MemoryHandle {
    fn with_file<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> T) -> io::Result<T> {
        let mut files = self.files.borrow_mut();
        match files.iter_mut().find(|(name, _)| *name == self.name) {
            Some((_, data)) => Ok(f(data)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file removed while open: {}", self.name),
            )),
        }
    }
}

impl Read for MemoryHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos as usize;
        let n = self.with_file(|data| {
            if pos >= data.len() {
                0
            } else {
                let n = buf.len().min(data.len() - pos);
                buf[..n].copy_from_slice(&data[pos..pos + n]);
                n
            }
        })?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.pos as usize;
        self.with_file(|data| {
            if data.len() < pos {
                data.resize(pos, 0);
            }
            let overlap = buf.len().min(data.len().saturating_sub(pos));
            data[pos..pos + overlap].copy_from_slice(&buf[..overlap]);
            data.extend_from_slice(&buf[overlap..]);
        })?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.with_file(|data| data.len() as u64)?;
        let new = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match new {
            Some(off) => {
                self.pos = off;
                Ok(off)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}

impl BlockStorage for MemoryStorage {
    type Reader = MemoryHandle;
    type Writer = MemoryHandle;

    fn open_read(&self, path: &str) -> io::Result<MemoryHandle> {
        match self.index_of(path) {
            Some(_) => Ok(MemoryHandle {
                files: Rc::clone(&self.files),
                name: Self::normalize(path),
                pos: 0,
            }),
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }

    fn open_write(&self, path: &str, truncate: bool) -> io::Result<MemoryHandle> {
        let name = Self::normalize(path);
        let mut files = self.files.borrow_mut();
        match files.iter_mut().find(|(n, _)| *n == name) {
            Some((_, data)) => {
                if truncate {
                    data.clear();
                }
            }
            None => files.push((name.clone(), Vec::new())),
        }
        drop(files);
        Ok(MemoryHandle {
            files: Rc::clone(&self.files),
            name,
            pos: 0,
        })
    }

    fn exists(&self, path: &str) -> bool {
        let prefix = Self::normalize(path);
        self.files
            .borrow()
            .iter()
            .any(|(name, _)| *name == prefix || name.starts_with(&format!("{}/", prefix)))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        match self.index_of(path) {
            Some(idx) => {
                self.files.borrow_mut().remove(idx);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        let mut files = self.files.borrow_mut();
        if let Some(idx) = files.iter().position(|(name, _)| *name == to) {
            files.remove(idx);
        }
        match files.iter_mut().find(|(name, _)| *name == from) {
            Some((name, _)) => {
                *name = to;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, from)),
        }
    }

    fn create_dir_all(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    fn remove_dir_all(&self, path: &str) -> io::Result<()> {
        let prefix = format!("{}/", Self::normalize(path));
        self.files
            .borrow_mut()
            .retain(|(name, _)| !name.starts_with(&prefix));
        Ok(())
    }
}
