//! Persistent spine/TOC index (`book.bin`) builder and reader.
//!
//! The index is built in passes because nothing about a large EPUB fits in
//! RAM at once. Spine entries and TOC entries are first appended to scratch
//! files in document order, then a final merge replays both scratch files to
//! produce one immutable `book.bin`:
//!
//! ```text
//! [version:u8][lutOffset:u64][spineCount:u32][tocCount:u32]
//! [title][author][coverHref]                  (length-prefixed strings)
//! [LUT: (spineCount+tocCount) x u64]          (absolute file offsets)
//! [spine records...][toc records...]
//! ```
//!
//! The lookup table can only be computed once every record's byte size is
//! known, which is why records are written twice: once to scratch, once to
//! the final file. The reader then serves any entry with two seeks and two
//! small reads, independent of book size.
//!
//! Spine/TOC cross-references are resolved by sequential scans of the
//! scratch files rather than an in-memory map; on the target hardware the
//! map is not affordable, so the O(entries^2) scan cost is the accepted
//! trade (a future on-storage side-index could lift it at the price of
//! format complexity).

use std::io::{Read, Seek, SeekFrom, Write};

use crate::archive::{normalize_path, ArchiveAccessor};
use crate::error::BookbinError;
use crate::serialize::{
    read_i32, read_str, read_u32, read_u64, read_u8, str_len, write_i32, write_str, write_u32,
    write_u64, write_u8,
};
use crate::storage::BlockStorage;

/// Format version written to and expected in the `book.bin` header.
pub const BOOK_CACHE_VERSION: u8 = 1;

/// Finished index file name within the cache directory.
pub const BOOK_BIN_FILE: &str = "book.bin";

const BOOK_BIN_TMP_FILE: &str = "book.bin.tmp";
const SPINE_SCRATCH_FILE: &str = "spine.bin.tmp";
const TOC_SCRATCH_FILE: &str = "toc.bin.tmp";

/// Fixed header: version byte + LUT offset + spine count + TOC count.
const HEADER_SIZE: u64 = 1 + 8 + 4 + 4;
/// Width of one LUT slot (an absolute u64 file offset).
const LUT_SLOT_SIZE: u64 = 8;

/// One entry of the linear reading order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpineEntry {
    /// Content path within the archive, resolved against the package base.
    pub href: String,
    /// Inflated bytes of this item plus all prior spine items.
    pub cumulative_size: u64,
    /// Index of the first TOC entry targeting this spine item, if any.
    pub toc_index: Option<u32>,
}

/// One entry of the table of contents, in NCX document order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocEntry {
    /// Display title.
    pub title: String,
    /// Target content path, resolved against the package base.
    pub href: String,
    /// In-document fragment anchor; empty when the entry targets a whole item.
    pub anchor: String,
    /// 1-based nesting depth.
    pub level: u8,
    /// Spine position this entry resolves to, if any.
    pub spine_index: Option<u32>,
}

/// Book-level metadata stored in the index header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookMetadata {
    /// Book title from `dc:title`.
    pub title: String,
    /// Author. The pipeline does not populate this yet; always empty.
    pub author: String,
    /// Resolved href of the manifest item named by the cover meta entry.
    pub cover_item_href: String,
}

fn encode_index(index: Option<u32>) -> i32 {
    index.map_or(-1, |i| i as i32)
}

fn decode_index(raw: i32) -> Option<u32> {
    u32::try_from(raw).ok()
}

fn write_spine_entry<W: Write>(w: &mut W, entry: &SpineEntry) -> std::io::Result<()> {
    write_str(w, &entry.href)?;
    write_u64(w, entry.cumulative_size)?;
    write_i32(w, encode_index(entry.toc_index))
}

fn read_spine_entry<R: Read>(r: &mut R) -> std::io::Result<SpineEntry> {
    Ok(SpineEntry {
        href: read_str(r)?,
        cumulative_size: read_u64(r)?,
        toc_index: decode_index(read_i32(r)?),
    })
}

fn write_toc_entry<W: Write>(w: &mut W, entry: &TocEntry) -> std::io::Result<()> {
    write_str(w, &entry.title)?;
    write_str(w, &entry.href)?;
    write_str(w, &entry.anchor)?;
    write_u8(w, entry.level)?;
    write_i32(w, encode_index(entry.spine_index))
}

fn read_toc_entry<R: Read>(r: &mut R) -> std::io::Result<TocEntry> {
    Ok(TocEntry {
        title: read_str(r)?,
        href: read_str(r)?,
        anchor: read_str(r)?,
        level: read_u8(r)?,
        spine_index: decode_index(read_i32(r)?),
    })
}

/// Build phase of a [`BookCacheBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPhase {
    /// No pass is active.
    Idle,
    /// Spine entries are being appended from the manifest/spine pass.
    SpinePass,
    /// TOC entries are being appended and resolved against the spine scratch.
    TocPass,
    /// Final `book.bin` assembly is running.
    Merging,
    /// The index has been written and renamed into place.
    Finalized,
}

/// Multi-pass builder for one `book.bin` index.
///
/// Creator methods called outside their matching phase log a warning and do
/// nothing; they never corrupt entries already written.
pub struct BookCacheBuilder<'a, S: BlockStorage> {
    storage: &'a S,
    cache_dir: String,
    phase: BuildPhase,
    spine_writer: Option<S::Writer>,
    spine_reader: Option<S::Reader>,
    toc_writer: Option<S::Writer>,
    spine_count: u32,
    toc_count: u32,
}

impl<'a, S: BlockStorage> BookCacheBuilder<'a, S> {
    /// Create an idle builder rooted at `cache_dir`.
    pub fn new(storage: &'a S, cache_dir: impl Into<String>) -> Self {
        Self {
            storage,
            cache_dir: cache_dir.into(),
            phase: BuildPhase::Idle,
            spine_writer: None,
            spine_reader: None,
            toc_writer: None,
            spine_count: 0,
            toc_count: 0,
        }
    }

    fn path(&self, file: &str) -> String {
        format!("{}/{}", self.cache_dir, file)
    }

    /// Current build phase.
    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    /// Number of spine entries written so far.
    pub fn spine_count(&self) -> u32 {
        self.spine_count
    }

    /// Number of TOC entries written so far.
    pub fn toc_count(&self) -> u32 {
        self.toc_count
    }

    /// Open the spine scratch file and enter the manifest/spine pass.
    pub fn begin_spine_pass(&mut self) -> Result<(), BookbinError> {
        if self.phase != BuildPhase::Idle {
            log::warn!("begin_spine_pass called in phase {:?}", self.phase);
        }
        self.spine_writer = Some(self.storage.open_write(&self.path(SPINE_SCRATCH_FILE), true)?);
        self.spine_count = 0;
        self.toc_count = 0;
        self.phase = BuildPhase::SpinePass;
        Ok(())
    }

    /// Append one spine entry in document order.
    ///
    /// The cumulative size and TOC back-reference are placeholders until the
    /// merge pass fills them in.
    pub fn create_spine_entry(&mut self, href: &str) -> Result<(), BookbinError> {
        let writer = match (&self.phase, self.spine_writer.as_mut()) {
            (BuildPhase::SpinePass, Some(writer)) => writer,
            _ => {
                log::warn!("create_spine_entry called outside spine pass; ignoring {}", href);
                return Ok(());
            }
        };

        let entry = SpineEntry {
            href: href.to_string(),
            cumulative_size: 0,
            toc_index: None,
        };
        write_spine_entry(writer, &entry)?;
        self.spine_count += 1;
        Ok(())
    }

    /// Close the spine scratch writer, completing the manifest/spine pass.
    pub fn end_spine_pass(&mut self) -> Result<(), BookbinError> {
        if let Some(mut writer) = self.spine_writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Reopen the spine scratch for resolution scans and open the TOC
    /// scratch for writing.
    ///
    /// All spine entries must already be written: TOC resolution scans the
    /// completed spine list.
    pub fn begin_toc_pass(&mut self) -> Result<(), BookbinError> {
        if self.phase != BuildPhase::SpinePass || self.spine_writer.is_some() {
            log::warn!("begin_toc_pass called in phase {:?}", self.phase);
        }
        self.spine_reader = Some(self.storage.open_read(&self.path(SPINE_SCRATCH_FILE))?);
        self.toc_writer = Some(self.storage.open_write(&self.path(TOC_SCRATCH_FILE), true)?);
        self.phase = BuildPhase::TocPass;
        Ok(())
    }

    /// Append one TOC entry, resolving its target href to a spine position.
    ///
    /// Resolution is a sequential scan of the spine scratch file from the
    /// start; no match is a warning, not an error, and the entry is stored
    /// with no spine index.
    pub fn create_toc_entry(
        &mut self,
        title: &str,
        href: &str,
        anchor: &str,
        level: u8,
    ) -> Result<(), BookbinError> {
        let (reader, writer) = match (
            self.phase,
            self.spine_reader.as_mut(),
            self.toc_writer.as_mut(),
        ) {
            (BuildPhase::TocPass, Some(reader), Some(writer)) => (reader, writer),
            _ => {
                log::warn!("create_toc_entry called outside toc pass; ignoring {}", href);
                return Ok(());
            }
        };

        let mut spine_index = None;
        reader.seek(SeekFrom::Start(0))?;
        for i in 0..self.spine_count {
            let spine_entry = read_spine_entry(reader)?;
            if spine_entry.href == href {
                spine_index = Some(i);
                break;
            }
        }

        if spine_index.is_none() {
            log::warn!("no spine item found for TOC href {}", href);
        }

        let entry = TocEntry {
            title: title.to_string(),
            href: href.to_string(),
            anchor: anchor.to_string(),
            level,
            spine_index,
        };
        write_toc_entry(writer, &entry)?;
        self.toc_count += 1;
        Ok(())
    }

    /// Close both TOC-pass handles.
    pub fn end_toc_pass(&mut self) -> Result<(), BookbinError> {
        self.spine_reader = None;
        if let Some(mut writer) = self.toc_writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Final assembly: replay both scratch files into one immutable
    /// `book.bin`.
    ///
    /// The archive is queried for each spine item's inflated size to build
    /// the running cumulative total, and the TOC scratch is re-scanned per
    /// spine entry to record the first TOC entry targeting it. The output is
    /// written to a temporary name and only renamed into place after every
    /// write succeeds, so a partial merge is never openable as an index.
    pub fn merge<A>(
        &mut self,
        archive: &mut A,
        metadata: &BookMetadata,
    ) -> Result<(), BookbinError>
    where
        A: ArchiveAccessor + ?Sized,
    {
        if self.phase != BuildPhase::TocPass || self.toc_writer.is_some() {
            return Err(BookbinError::Malformed(format!(
                "merge called in phase {:?}",
                self.phase
            )));
        }
        self.phase = BuildPhase::Merging;

        let result = self.write_book_bin(archive, metadata);
        self.cleanup_scratch();
        match result {
            Ok(()) => {
                self.phase = BuildPhase::Finalized;
                log::debug!(
                    "finalized book.bin with {} spine, {} TOC entries",
                    self.spine_count,
                    self.toc_count
                );
                Ok(())
            }
            Err(err) => {
                // Never leave a half-written output mounted as valid.
                if self.storage.exists(&self.path(BOOK_BIN_TMP_FILE)) {
                    let _ = self.storage.remove(&self.path(BOOK_BIN_TMP_FILE));
                }
                Err(err)
            }
        }
    }

    fn write_book_bin<A>(
        &mut self,
        archive: &mut A,
        metadata: &BookMetadata,
    ) -> Result<(), BookbinError>
    where
        A: ArchiveAccessor + ?Sized,
    {
        let mut book = self.storage.open_write(&self.path(BOOK_BIN_TMP_FILE), true)?;
        let mut spine = self.storage.open_read(&self.path(SPINE_SCRATCH_FILE))?;
        let mut toc = self.storage.open_read(&self.path(TOC_SCRATCH_FILE))?;

        let metadata_size = str_len(&metadata.title)
            + str_len(&metadata.author)
            + str_len(&metadata.cover_item_href);
        let lut_offset = HEADER_SIZE + metadata_size;
        let lut_size = LUT_SLOT_SIZE * (self.spine_count as u64 + self.toc_count as u64);

        write_u8(&mut book, BOOK_CACHE_VERSION)?;
        write_u64(&mut book, lut_offset)?;
        write_u32(&mut book, self.spine_count)?;
        write_u32(&mut book, self.toc_count)?;
        write_str(&mut book, &metadata.title)?;
        write_str(&mut book, &metadata.author)?;
        write_str(&mut book, &metadata.cover_item_href)?;

        // Spine LUT: scratch record offsets shifted past header + LUT. The
        // scratch and final encodings are identical, so scratch positions
        // carry over directly.
        spine.seek(SeekFrom::Start(0))?;
        for _ in 0..self.spine_count {
            let pos = spine.stream_position()?;
            read_spine_entry(&mut spine)?;
            write_u64(&mut book, lut_offset + lut_size + pos)?;
        }
        let spine_data_size = spine.stream_position()?;

        // TOC LUT: same, shifted additionally past the spine data block.
        toc.seek(SeekFrom::Start(0))?;
        for _ in 0..self.toc_count {
            let pos = toc.stream_position()?;
            read_toc_entry(&mut toc)?;
            write_u64(&mut book, lut_offset + lut_size + spine_data_size + pos)?;
        }

        // Spine data block: fill in cumulative sizes and TOC back-references.
        let mut cumulative = 0u64;
        spine.seek(SeekFrom::Start(0))?;
        for i in 0..self.spine_count {
            let mut entry = read_spine_entry(&mut spine)?;

            toc.seek(SeekFrom::Start(0))?;
            for j in 0..self.toc_count {
                let toc_entry = read_toc_entry(&mut toc)?;
                if toc_entry.spine_index == Some(i) {
                    entry.toc_index = Some(j);
                    break;
                }
            }
            if entry.toc_index.is_none() {
                // Expected for EPUBs whose TOC does not cover every item.
                log::warn!("no TOC entry found for spine item {}: {}", i, entry.href);
            }

            match archive.inflated_size(&normalize_path(&entry.href)) {
                Ok(size) => cumulative += size,
                Err(err) => {
                    log::warn!("could not size spine item {}: {}", entry.href, err);
                }
            }
            entry.cumulative_size = cumulative;

            write_spine_entry(&mut book, &entry)?;
        }

        // TOC data block: replayed verbatim.
        toc.seek(SeekFrom::Start(0))?;
        for _ in 0..self.toc_count {
            let entry = read_toc_entry(&mut toc)?;
            write_toc_entry(&mut book, &entry)?;
        }

        book.flush()?;
        drop(book);
        drop(spine);
        drop(toc);

        self.storage
            .rename(&self.path(BOOK_BIN_TMP_FILE), &self.path(BOOK_BIN_FILE))?;
        Ok(())
    }

    /// Remove scratch files, logging and ignoring failures.
    pub fn cleanup_scratch(&self) {
        for file in [SPINE_SCRATCH_FILE, TOC_SCRATCH_FILE] {
            let path = self.path(file);
            if self.storage.exists(&path) {
                if let Err(err) = self.storage.remove(&path) {
                    log::warn!("could not remove scratch file {}: {}", path, err);
                }
            }
        }
    }
}

/// Random-access reader over a finished `book.bin`.
///
/// The header and metadata block are read eagerly on open; spine and TOC
/// records are only read on demand, one record per query.
pub struct BookCache<S: BlockStorage> {
    file: S::Reader,
    lut_offset: u64,
    spine_count: u32,
    toc_count: u32,
    metadata: BookMetadata,
}

impl<S: BlockStorage> core::fmt::Debug for BookCache<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BookCache")
            .field("lut_offset", &self.lut_offset)
            .field("spine_count", &self.spine_count)
            .field("toc_count", &self.toc_count)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl<S: BlockStorage> BookCache<S> {
    /// Open the index under `cache_dir`.
    ///
    /// Fails with [`BookbinError::NotFound`] when no index exists and
    /// [`BookbinError::VersionMismatch`] when the format version byte
    /// differs; callers must treat both as "no cache" and rebuild.
    pub fn open(storage: &S, cache_dir: &str) -> Result<Self, BookbinError> {
        let mut file = storage.open_read(&format!("{}/{}", cache_dir, BOOK_BIN_FILE))?;

        let version = read_u8(&mut file)?;
        if version != BOOK_CACHE_VERSION {
            return Err(BookbinError::VersionMismatch {
                expected: BOOK_CACHE_VERSION,
                found: version,
            });
        }

        let lut_offset = read_u64(&mut file)?;
        let spine_count = read_u32(&mut file)?;
        let toc_count = read_u32(&mut file)?;
        let metadata = BookMetadata {
            title: read_str(&mut file)?,
            author: read_str(&mut file)?,
            cover_item_href: read_str(&mut file)?,
        };

        log::debug!(
            "loaded book.bin: {} spine, {} TOC entries",
            spine_count,
            toc_count
        );

        Ok(Self {
            file,
            lut_offset,
            spine_count,
            toc_count,
            metadata,
        })
    }

    /// Book-level metadata from the index header block.
    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    /// Number of spine entries.
    pub fn spine_count(&self) -> u32 {
        self.spine_count
    }

    /// Number of TOC entries.
    pub fn toc_count(&self) -> u32 {
        self.toc_count
    }

    /// Fetch one spine entry: two seeks and two small reads.
    ///
    /// Out-of-range indexes and read failures return a default entry after
    /// logging; queries never fail hard once the index is open.
    pub fn spine_entry(&mut self, index: u32) -> SpineEntry {
        if index >= self.spine_count {
            log::warn!("spine_entry index {} out of range", index);
            return SpineEntry::default();
        }
        self.read_spine_at(index).unwrap_or_else(|err| {
            log::warn!("could not read spine entry {}: {}", index, err);
            SpineEntry::default()
        })
    }

    /// Fetch one TOC entry: two seeks and two small reads.
    ///
    /// Same failure policy as [`spine_entry`](Self::spine_entry).
    pub fn toc_entry(&mut self, index: u32) -> TocEntry {
        if index >= self.toc_count {
            log::warn!("toc_entry index {} out of range", index);
            return TocEntry::default();
        }
        self.read_toc_at(index).unwrap_or_else(|err| {
            log::warn!("could not read TOC entry {}: {}", index, err);
            TocEntry::default()
        })
    }

    fn read_spine_at(&mut self, index: u32) -> std::io::Result<SpineEntry> {
        self.file
            .seek(SeekFrom::Start(self.lut_offset + LUT_SLOT_SIZE * index as u64))?;
        let pos = read_u64(&mut self.file)?;
        self.file.seek(SeekFrom::Start(pos))?;
        read_spine_entry(&mut self.file)
    }

    fn read_toc_at(&mut self, index: u32) -> std::io::Result<TocEntry> {
        let slot = self.lut_offset + LUT_SLOT_SIZE * (self.spine_count as u64 + index as u64);
        self.file.seek(SeekFrom::Start(slot))?;
        let pos = read_u64(&mut self.file)?;
        self.file.seek(SeekFrom::Start(pos))?;
        read_toc_entry(&mut self.file)
    }
}
