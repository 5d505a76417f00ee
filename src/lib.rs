//! bookbin -- Persistent EPUB index pipeline for embedded readers
//!
//! Ingests an EPUB archive once, in bounded memory, and produces a compact
//! on-storage index (`book.bin`) that answers spine, table-of-contents, and
//! reading-progress queries in constant time without reopening the archive.
//!
//! # Design
//!
//! Nothing in the pipeline scales its RAM use with book size: XML documents
//! are spooled to scratch files and parsed through small fixed buffers, and
//! cross-references between the spine and the TOC are resolved by sequential
//! scans of those scratch files instead of in-memory maps. The finished
//! index serves any entry with two seeks through a lookup table.
//!
//! The platform provides archive access ([`ArchiveAccessor`]) and block
//! storage ([`BlockStorage`]); hosts and tests use the in-memory
//! implementations of both.

#![warn(missing_docs)]
#![deny(clippy::large_enum_variant, clippy::large_stack_arrays, clippy::redundant_clone)]
#![warn(
    clippy::box_collection,
    clippy::needless_collect,
    clippy::map_clone,
    clippy::implicit_clone,
    clippy::inefficient_to_string
)]

pub mod archive;
pub mod book;
pub mod cache;
pub mod container;
pub mod error;
pub mod ncx;
pub mod package;
pub mod serialize;
pub mod storage;

mod streaming;

// Re-export key types for convenience
pub use archive::{normalize_path, ArchiveAccessor, MemoryArchive, DEFAULT_CHUNK_SIZE};
pub use book::{cache_key, Book, PipelineConfig};
pub use cache::{
    BookCache, BookCacheBuilder, BookMetadata, BuildPhase, SpineEntry, TocEntry,
    BOOK_CACHE_VERSION,
};
pub use container::{locate_package_document, CONTAINER_PATH};
pub use error::BookbinError;
pub use ncx::parse_ncx_document;
pub use package::{parse_package_document, PackageSummary, MEDIA_TYPE_NCX};
pub use storage::{BlockStorage, FsStorage, MemoryStorage};
