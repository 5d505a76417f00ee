//! Archive-to-parser glue.
//!
//! Every XML document the pipeline touches is first spooled from the archive
//! into a scratch file on block storage in small chunks, then parsed from
//! that file through a small `BufReader`. This keeps peak RAM independent of
//! document size: the original documents never exist in memory, only a
//! bounded read buffer does.

use std::io::{BufReader, Read, Write};

use crate::archive::{normalize_path, ArchiveAccessor};
use crate::error::BookbinError;
use crate::storage::BlockStorage;

/// Read buffer capacity for parsing spooled documents.
pub(crate) const PARSE_BUF_SIZE: usize = 512;

/// Spool a decompressed archive entry into a scratch file.
///
/// The entry path is normalized before the archive lookup. Returns the
/// number of bytes spooled.
pub(crate) fn spool_to_scratch<A, S>(
    archive: &mut A,
    storage: &S,
    entry_path: &str,
    scratch_path: &str,
    chunk_size: usize,
) -> Result<u64, BookbinError>
where
    A: ArchiveAccessor + ?Sized,
    S: BlockStorage,
{
    let mut sink = storage.open_write(scratch_path, true)?;
    let written = archive.stream_to(&normalize_path(entry_path), &mut sink, chunk_size)?;
    sink.flush()?;
    Ok(written)
}

/// Open a spooled scratch document for parsing with a bounded buffer.
pub(crate) fn open_for_parse<S: BlockStorage>(
    storage: &S,
    scratch_path: &str,
) -> Result<BufReader<S::Reader>, BookbinError> {
    let handle = storage.open_read(scratch_path)?;
    Ok(BufReader::with_capacity(PARSE_BUF_SIZE, handle))
}

/// Remove a scratch file, logging and ignoring failure.
pub(crate) fn remove_scratch<S: BlockStorage>(storage: &S, scratch_path: &str) {
    if storage.exists(scratch_path) {
        if let Err(err) = storage.remove(scratch_path) {
            log::warn!("failed to remove scratch file {}: {}", scratch_path, err);
        }
    }
}

/// Map a byte offset in a scratch document to a 1-based line number.
///
/// The parser only reports byte offsets; the line is recovered by
/// re-scanning the document in [`PARSE_BUF_SIZE`] chunks, so the conversion
/// itself stays within the bounded-memory budget. Falls back to line 1 when
/// the document cannot be re-read.
pub(crate) fn line_of_offset<S: BlockStorage>(storage: &S, scratch_path: &str, offset: u64) -> u32 {
    let mut handle = match storage.open_read(scratch_path) {
        Ok(handle) => handle,
        Err(_) => return 1,
    };

    let mut line = 1u32;
    let mut remaining = offset;
    let mut buf = [0u8; PARSE_BUF_SIZE];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = match handle.read(&mut buf[..want]) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        line += buf[..n].iter().filter(|&&b| b == b'\n').count() as u32;
        remaining -= n as u64;
    }
    line
}

/// Build a [`BookbinError::Parse`] carrying the line number of `offset`.
pub(crate) fn parse_error_at<S: BlockStorage>(
    storage: &S,
    scratch_path: &str,
    offset: u64,
    message: String,
) -> BookbinError {
    BookbinError::Parse {
        line: line_of_offset(storage, scratch_path, offset),
        message,
    }
}
