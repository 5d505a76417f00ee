//! End-to-end tests for the bookbin pipeline.
//!
//! Each test drives the full ingestion path (container, package document,
//! NCX, merge) against an in-memory archive and verifies the result through
//! the public query API. Filesystem-backed storage is exercised separately
//! with tempfile.

use bookbin::{
    BlockStorage, Book, BookCache, BookbinError, FsStorage, MemoryArchive, MemoryStorage,
    PipelineConfig, BOOK_CACHE_VERSION,
};

use std::io::{Seek, SeekFrom, Write};

// -- Fixture ------------------------------------------------------------------

const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

const CONTENT_OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>The Time Machine</dc:title>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="c1" href="chap1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="chap2.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
    <item id="nav" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="nav">
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#;

const TOC_NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="np1" playOrder="1">
      <navLabel><text>Chapter 1</text></navLabel>
      <content src="chap1.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

fn sample_archive() -> MemoryArchive {
    MemoryArchive::new()
        .with_entry("META-INF/container.xml", CONTAINER_XML)
        .with_entry("OEBPS/content.opf", CONTENT_OPF)
        .with_entry("OEBPS/toc.ncx", TOC_NCX)
        .with_entry("OEBPS/chap1.xhtml", vec![b'x'; 1000])
        .with_entry("OEBPS/chap2.xhtml", vec![b'y'; 1500])
        .with_entry("OEBPS/images/cover.jpg", vec![0u8; 64])
}

fn sample_config() -> PipelineConfig {
    PipelineConfig::new("/books/time-machine.epub", "cache")
}

// -- Full pipeline ------------------------------------------------------------

#[test]
fn test_full_ingestion() {
    let mut archive = sample_archive();
    let storage = MemoryStorage::new();

    let mut book = Book::load(&mut archive, &storage, &sample_config()).unwrap();

    assert_eq!(book.title(), "The Time Machine");
    assert_eq!(book.cover_item_href(), "OEBPS/images/cover.jpg");
    assert_eq!(book.spine_count(), 2);
    assert_eq!(book.toc_count(), 1);

    let first = book.spine_entry(0);
    assert_eq!(first.href, "OEBPS/chap1.xhtml");
    assert_eq!(first.cumulative_size, 1000);
    assert_eq!(first.toc_index, Some(0));

    let second = book.spine_entry(1);
    assert_eq!(second.href, "OEBPS/chap2.xhtml");
    assert_eq!(second.cumulative_size, 2500);
    // chap2 is not in the TOC
    assert_eq!(second.toc_index, None);

    let toc = book.toc_entry(0);
    assert_eq!(toc.title, "Chapter 1");
    assert_eq!(toc.href, "OEBPS/chap1.xhtml");
    assert_eq!(toc.anchor, "");
    assert_eq!(toc.level, 1);
    assert_eq!(toc.spine_index, Some(0));

    assert_eq!(book.book_size(), 2500);
}

#[test]
fn test_scratch_files_are_gone_after_ingestion() {
    let mut archive = sample_archive();
    let storage = MemoryStorage::new();
    let config = sample_config();

    let _ = Book::load(&mut archive, &storage, &config).unwrap();

    let dir = config.cache_dir();
    assert!(storage.exists(&format!("{}/book.bin", dir)));
    for scratch in [
        "spine.bin.tmp",
        "toc.bin.tmp",
        "book.bin.tmp",
        "container.xml.tmp",
        "content.opf.tmp",
        "items.bin.tmp",
        "toc.ncx.tmp",
    ] {
        assert!(
            !storage.exists(&format!("{}/{}", dir, scratch)),
            "{} left behind",
            scratch
        );
    }
}

// -- Cache behavior -----------------------------------------------------------

#[test]
fn test_second_load_is_served_from_cache() {
    let storage = MemoryStorage::new();
    let config = sample_config();

    {
        let mut archive = sample_archive();
        let _ = Book::load(&mut archive, &storage, &config).unwrap();
    }

    // An empty archive would fail ingestion, so a successful load proves
    // the index alone answered.
    let mut empty = MemoryArchive::new();
    let mut book = Book::load(&mut empty, &storage, &config).unwrap();
    assert_eq!(book.title(), "The Time Machine");
    assert_eq!(book.spine_entry(1).cumulative_size, 2500);
}

#[test]
fn test_version_mismatch_triggers_rebuild() {
    let storage = MemoryStorage::new();
    let config = sample_config();
    let mut archive = sample_archive();

    let _ = Book::load(&mut archive, &storage, &config).unwrap();

    // Corrupt the version byte in place
    let book_bin = format!("{}/book.bin", config.cache_dir());
    let mut handle = storage.open_write(&book_bin, false).unwrap();
    handle.seek(SeekFrom::Start(0)).unwrap();
    handle.write_all(&[BOOK_CACHE_VERSION + 1]).unwrap();
    drop(handle);

    assert!(matches!(
        BookCache::<MemoryStorage>::open(&storage, &config.cache_dir()),
        Err(BookbinError::VersionMismatch { .. })
    ));

    let mut book = Book::load(&mut archive, &storage, &config).unwrap();
    assert_eq!(book.spine_count(), 2);
    assert_eq!(book.title(), "The Time Machine");
}

#[test]
fn test_clear_cache_then_reload() {
    let storage = MemoryStorage::new();
    let config = sample_config();
    let mut archive = sample_archive();

    let _ = Book::load(&mut archive, &storage, &config).unwrap();
    Book::clear_cache(&storage, &config).unwrap();
    assert!(!storage.exists(&format!("{}/book.bin", config.cache_dir())));

    let mut book = Book::load(&mut archive, &storage, &config).unwrap();
    assert_eq!(book.toc_count(), 1);
}

// -- Failure paths ------------------------------------------------------------

#[test]
fn test_missing_container_leaves_no_index() {
    let mut archive = MemoryArchive::new().with_entry("mimetype", "application/epub+zip");
    let storage = MemoryStorage::new();
    let config = PipelineConfig::new("/books/broken.epub", "cache");

    let err = Book::load(&mut archive, &storage, &config).unwrap_err();
    assert!(matches!(err, BookbinError::NotFound(_)));
    assert!(!storage.exists(&format!("{}/book.bin", config.cache_dir())));
}

#[test]
fn test_malformed_package_reports_line() {
    let mut archive = MemoryArchive::new()
        .with_entry("META-INF/container.xml", CONTAINER_XML)
        .with_entry(
            "OEBPS/content.opf",
            "<package>\n<manifest>\n</broken>\n</package>",
        );
    let storage = MemoryStorage::new();
    let config = PipelineConfig::new("/books/bad-opf.epub", "cache");

    let err = Book::load(&mut archive, &storage, &config).unwrap_err();
    match err {
        BookbinError::Parse { line, .. } => assert!(line >= 2, "line was {}", line),
        other => panic!("expected parse error, got {:?}", other),
    }
    assert!(!storage.exists(&format!("{}/book.bin", config.cache_dir())));
}

#[test]
fn test_missing_spine_item_sizes_are_non_fatal() {
    // chap2.xhtml is declared but absent from the archive; its size lookup
    // fails and contributes nothing to the running total.
    let mut archive = MemoryArchive::new()
        .with_entry("META-INF/container.xml", CONTAINER_XML)
        .with_entry("OEBPS/content.opf", CONTENT_OPF)
        .with_entry("OEBPS/toc.ncx", TOC_NCX)
        .with_entry("OEBPS/chap1.xhtml", vec![b'x'; 1000]);
    let storage = MemoryStorage::new();
    let config = PipelineConfig::new("/books/partial.epub", "cache");

    let mut book = Book::load(&mut archive, &storage, &config).unwrap();
    assert_eq!(book.spine_count(), 2);
    assert_eq!(book.spine_entry(0).cumulative_size, 1000);
    assert_eq!(book.spine_entry(1).cumulative_size, 1000);
}

// -- Progress -----------------------------------------------------------------

#[test]
fn test_progress_across_the_whole_book() {
    let mut archive = sample_archive();
    let storage = MemoryStorage::new();

    let mut book = Book::load(&mut archive, &storage, &sample_config()).unwrap();

    assert_eq!(book.calculate_progress(0, 0.0), 0);
    // end of chap1: 1000 / 2500
    assert_eq!(book.calculate_progress(0, 1.0), 40);
    assert_eq!(book.calculate_progress(1, 0.0), 40);
    // halfway through chap2: (1000 + 750) / 2500
    assert_eq!(book.calculate_progress(1, 0.5), 70);
    assert_eq!(book.calculate_progress(1, 1.0), 100);
}

// -- Filesystem storage -------------------------------------------------------

#[test]
fn test_pipeline_on_filesystem_storage() {
    let root = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(root.path());
    let config = sample_config();
    let mut archive = sample_archive();

    let mut book = Book::load(&mut archive, &storage, &config).unwrap();
    assert_eq!(book.title(), "The Time Machine");
    assert_eq!(book.spine_entry(1).cumulative_size, 2500);

    // The index is a real file under the cache root
    let book_bin = root
        .path()
        .join(config.cache_dir())
        .join("book.bin");
    assert!(book_bin.is_file());

    // Reload from disk without touching the archive
    let mut empty = MemoryArchive::new();
    let mut reloaded = Book::load(&mut empty, &storage, &config).unwrap();
    assert_eq!(reloaded.toc_entry(0).title, "Chapter 1");
}
