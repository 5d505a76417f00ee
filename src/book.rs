//! Pipeline orchestrator.
//!
//! [`Book::load`] is the one entry point the device UI calls: open the
//! persistent index if a valid one exists, otherwise run the full ingestion
//! pipeline (container, package, NCX, merge) and open the result. A builder
//! is never served directly; queries always go through a fresh
//! [`BookCache`] opened from the finished file.

use crate::archive::ArchiveAccessor;
use crate::cache::{BookCache, BookCacheBuilder, BookMetadata, SpineEntry, TocEntry};
use crate::container;
use crate::error::BookbinError;
use crate::ncx;
use crate::package;
use crate::storage::BlockStorage;

/// Where a book's archive lives and where its index may be cached.
///
/// Passed explicitly to [`Book::load`]; nothing in the pipeline reads
/// ambient global state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Path of the EPUB archive on the host filesystem. Only used as the
    /// cache key; the archive itself is reached through [`ArchiveAccessor`].
    pub archive_path: String,
    /// Directory under which per-book cache directories are created.
    pub cache_root: String,
}

impl PipelineConfig {
    /// Configuration for one book.
    pub fn new(archive_path: impl Into<String>, cache_root: impl Into<String>) -> Self {
        Self {
            archive_path: archive_path.into(),
            cache_root: cache_root.into(),
        }
    }

    /// Cache directory for this book: `cache_root/<crc32 of archive path>`.
    pub fn cache_dir(&self) -> String {
        format!("{}/{}", self.cache_root, cache_key(&self.archive_path))
    }
}

/// Stable per-book cache key: the CRC32 of the archive path, in hex.
pub fn cache_key(archive_path: &str) -> String {
    format!("{:08x}", crc32fast::hash(archive_path.as_bytes()))
}

/// An opened book, backed entirely by its persistent index.
///
/// All queries are O(1) in book size; the archive is not touched again
/// after loading.
pub struct Book<S: BlockStorage> {
    cache: BookCache<S>,
    cache_dir: String,
}

impl<S: BlockStorage> core::fmt::Debug for Book<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Book")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl<S: BlockStorage> Book<S> {
    /// Open the book, building its index first if necessary.
    ///
    /// Any failure to open the existing index (missing, version-mismatched,
    /// or unreadable) triggers a full rebuild. On a rebuild failure the
    /// scratch files are cleaned up and no partial index is left behind.
    pub fn load<A>(
        archive: &mut A,
        storage: &S,
        config: &PipelineConfig,
    ) -> Result<Self, BookbinError>
    where
        A: ArchiveAccessor + ?Sized,
    {
        let cache_dir = config.cache_dir();

        match BookCache::open(storage, &cache_dir) {
            Ok(cache) => {
                log::debug!("cache hit for {}", config.archive_path);
                return Ok(Self { cache, cache_dir });
            }
            Err(err) if err.is_cache_miss() => {
                log::debug!("cache miss for {}: {}", config.archive_path, err);
            }
            Err(err) => {
                // An unreadable index is no better than a missing one.
                log::warn!("discarding unreadable index for {}: {}", config.archive_path, err);
            }
        }

        storage.create_dir_all(&cache_dir)?;
        let mut builder = BookCacheBuilder::new(storage, cache_dir.clone());
        if let Err(err) = run_pipeline(archive, storage, &mut builder, &cache_dir) {
            builder.cleanup_scratch();
            return Err(err);
        }

        let cache = BookCache::open(storage, &cache_dir)?;
        Ok(Self { cache, cache_dir })
    }

    /// Delete this book's cache directory.
    ///
    /// The next [`load`](Self::load) for the same configuration rebuilds
    /// from the archive.
    pub fn clear_cache(storage: &S, config: &PipelineConfig) -> Result<(), BookbinError> {
        storage.remove_dir_all(&config.cache_dir())?;
        Ok(())
    }

    /// Cache directory backing this book.
    pub fn cache_dir(&self) -> &str {
        &self.cache_dir
    }

    /// Book title from `dc:title`.
    pub fn title(&self) -> &str {
        &self.cache.metadata().title
    }

    /// Resolved href of the cover image item, empty if the book has none.
    pub fn cover_item_href(&self) -> &str {
        &self.cache.metadata().cover_item_href
    }

    /// Number of spine items.
    pub fn spine_count(&self) -> u32 {
        self.cache.spine_count()
    }

    /// Number of TOC entries.
    pub fn toc_count(&self) -> u32 {
        self.cache.toc_count()
    }

    /// Fetch one spine entry.
    pub fn spine_entry(&mut self, index: u32) -> SpineEntry {
        self.cache.spine_entry(index)
    }

    /// Fetch one TOC entry.
    pub fn toc_entry(&mut self, index: u32) -> TocEntry {
        self.cache.toc_entry(index)
    }

    /// Spine position to jump to for a TOC entry.
    ///
    /// An unresolved entry falls back to the first spine item so navigation
    /// always lands somewhere.
    pub fn spine_index_for_toc_index(&mut self, toc_index: u32) -> u32 {
        match self.cache.toc_entry(toc_index).spine_index {
            Some(index) => index,
            None => {
                log::warn!("TOC entry {} has no spine target; using 0", toc_index);
                0
            }
        }
    }

    /// First TOC entry covering a spine item, if the TOC mentions it.
    pub fn toc_index_for_spine_index(&mut self, spine_index: u32) -> Option<u32> {
        self.cache.spine_entry(spine_index).toc_index
    }

    /// Total inflated content size: the last spine entry's running total.
    pub fn book_size(&mut self) -> u64 {
        match self.cache.spine_count() {
            0 => 0,
            count => self.cache.spine_entry(count - 1).cumulative_size,
        }
    }

    /// Whole-book progress percentage for a position within a spine item.
    ///
    /// `fraction` is how far through the item the reader is, clamped to
    /// 0..=1. Byte counts weight each item, so a long chapter moves the
    /// percentage more than a short one.
    pub fn calculate_progress(&mut self, spine_index: u32, fraction: f32) -> u8 {
        let total = self.book_size();
        if total == 0 {
            return 0;
        }

        let current = self.cache.spine_entry(spine_index).cumulative_size;
        let previous = match spine_index {
            0 => 0,
            i => self.cache.spine_entry(i - 1).cumulative_size,
        };
        let within = fraction.clamp(0.0, 1.0) * current.saturating_sub(previous) as f32;
        let percent = (previous as f32 + within) / total as f32 * 100.0;
        percent.round().clamp(0.0, 100.0) as u8
    }
}

fn run_pipeline<A, S>(
    archive: &mut A,
    storage: &S,
    builder: &mut BookCacheBuilder<'_, S>,
    cache_dir: &str,
) -> Result<(), BookbinError>
where
    A: ArchiveAccessor + ?Sized,
    S: BlockStorage,
{
    let opf_path = container::locate_package_document(archive, storage, cache_dir)?;
    log::debug!("package document at {}", opf_path);

    builder.begin_spine_pass()?;
    let summary =
        package::parse_package_document(archive, storage, builder, &opf_path, cache_dir)?;
    builder.end_spine_pass()?;

    let ncx_path = summary
        .toc_ncx_path
        .clone()
        .ok_or_else(|| BookbinError::Malformed("manifest declares no NCX document".into()))?;

    builder.begin_toc_pass()?;
    ncx::parse_ncx_document(
        archive,
        storage,
        builder,
        &ncx_path,
        &summary.base_dir,
        cache_dir,
    )?;
    builder.end_toc_pass()?;

    let metadata = BookMetadata {
        title: summary.title,
        author: String::new(),
        cover_item_href: summary.cover_item_href,
    };
    builder.merge(archive, &metadata)
}
