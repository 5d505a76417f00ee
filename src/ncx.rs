//! NCX table-of-contents resolver.
//!
//! Walks the `navMap` of an NCX document, emitting one TOC entry per
//! `navPoint` content target. Nesting depth becomes the entry level, and
//! each target href is resolved against the spine through the builder's
//! scratch scan.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::archive::{ArchiveAccessor, DEFAULT_CHUNK_SIZE};
use crate::cache::BookCacheBuilder;
use crate::error::BookbinError;
use crate::storage::BlockStorage;
use crate::streaming;

fn bare_name(name: &str) -> &str {
    name.strip_prefix("ncx:").unwrap_or(name)
}

/// Split a `content src` into (document href, fragment anchor).
fn split_src(src: &str) -> (&str, &str) {
    match src.find('#') {
        Some(idx) => (&src[..idx], &src[idx + 1..]),
        None => (src, ""),
    }
}

/// Parse the NCX document at `ncx_path`, emitting TOC entries into
/// `builder`.
///
/// `builder` must already be in its TOC pass. Hrefs are resolved relative
/// to `base_dir`, the package document's directory. `navPoint` nesting
/// depth is recorded as the entry level, starting at 1 for top-level
/// points. Targets that match no spine item are stored without a spine
/// index (the builder logs the miss); malformed XML aborts with
/// [`BookbinError::Parse`] and a line number.
pub fn parse_ncx_document<A, S>(
    archive: &mut A,
    storage: &S,
    builder: &mut BookCacheBuilder<'_, S>,
    ncx_path: &str,
    base_dir: &str,
    scratch_dir: &str,
) -> Result<(), BookbinError>
where
    A: ArchiveAccessor + ?Sized,
    S: BlockStorage,
{
    let scratch_path = format!("{}/toc.ncx.tmp", scratch_dir);
    let result =
        streaming::spool_to_scratch(archive, storage, ncx_path, &scratch_path, DEFAULT_CHUNK_SIZE)
            .and_then(|_| parse_spooled_ncx(storage, builder, &scratch_path, base_dir));
    streaming::remove_scratch(storage, &scratch_path);
    result
}

fn parse_spooled_ncx<S: BlockStorage>(
    storage: &S,
    builder: &mut BookCacheBuilder<'_, S>,
    scratch_path: &str,
    base_dir: &str,
) -> Result<(), BookbinError> {
    let mut reader = Reader::from_reader(streaming::open_for_parse(storage, scratch_path)?);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_nav_map = false;
    // One label slot per open navPoint; content targets read the top.
    let mut label_stack: Vec<String> = Vec::new();
    let mut in_label_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .unwrap_or_default()
                    .to_string();

                match bare_name(&name) {
                    "navMap" => in_nav_map = true,
                    "navPoint" if in_nav_map => label_stack.push(String::new()),
                    "text" if in_nav_map && !label_stack.is_empty() => in_label_text = true,
                    "content" if in_nav_map && !label_stack.is_empty() => {
                        let mut src = String::new();
                        for attr in e.attributes().flatten() {
                            let key = reader
                                .decoder()
                                .decode(attr.key.as_ref())
                                .unwrap_or_default();
                            if key == "src" {
                                src = reader
                                    .decoder()
                                    .decode(&attr.value)
                                    .unwrap_or_default()
                                    .to_string();
                            }
                        }
                        if !src.is_empty() {
                            let (doc, anchor) = split_src(&src);
                            let href = format!("{}{}", base_dir, doc);
                            let title = label_stack.last().cloned().unwrap_or_default();
                            let level = label_stack.len().min(u8::MAX as usize) as u8;
                            builder.create_toc_entry(&title, &href, anchor, level)?;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_label_text {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    if let Some(label) = label_stack.last_mut() {
                        label.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .unwrap_or_default()
                    .to_string();
                match bare_name(&name) {
                    "navMap" => in_nav_map = false,
                    "navPoint" => {
                        label_stack.pop();
                    }
                    "text" => in_label_text = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(streaming::parse_error_at(
                    storage,
                    scratch_path,
                    reader.buffer_position(),
                    format!("NCX parse error: {:?}", e),
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::cache::{BookCache, BookMetadata};
    use crate::storage::MemoryStorage;

    const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head><meta name="dtb:depth" content="2"/></head>
  <docTitle><text>The Time Machine</text></docTitle>
  <navMap>
    <navPoint id="np1" playOrder="1">
      <navLabel><text>Chapter 1</text></navLabel>
      <content src="chap1.xhtml"/>
      <navPoint id="np2" playOrder="2">
        <navLabel><text>Section 1.1</text></navLabel>
        <content src="chap1.xhtml#sec11"/>
      </navPoint>
    </navPoint>
    <navPoint id="np3" playOrder="3">
      <navLabel><text>Chapter 2</text></navLabel>
      <content src="chap2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

    fn build_with_ncx(ncx: &str) -> (MemoryStorage, u32) {
        let mut archive = MemoryArchive::new()
            .with_entry("OEBPS/toc.ncx", ncx)
            .with_entry("OEBPS/chap1.xhtml", vec![0u8; 100])
            .with_entry("OEBPS/chap2.xhtml", vec![0u8; 200]);
        let storage = MemoryStorage::new();
        let mut builder = BookCacheBuilder::new(&storage, "cache");

        builder.begin_spine_pass().unwrap();
        builder.create_spine_entry("OEBPS/chap1.xhtml").unwrap();
        builder.create_spine_entry("OEBPS/chap2.xhtml").unwrap();
        builder.end_spine_pass().unwrap();

        builder.begin_toc_pass().unwrap();
        parse_ncx_document(
            &mut archive,
            &storage,
            &mut builder,
            "OEBPS/toc.ncx",
            "OEBPS/",
            "cache",
        )
        .unwrap();
        builder.end_toc_pass().unwrap();
        let count = builder.toc_count();
        builder.merge(&mut archive, &BookMetadata::default()).unwrap();
        (storage, count)
    }

    #[test]
    fn test_nested_nav_points() {
        let (storage, count) = build_with_ncx(NCX);
        assert_eq!(count, 3);

        let mut cache = BookCache::open(&storage, "cache").unwrap();

        let first = cache.toc_entry(0);
        assert_eq!(first.title, "Chapter 1");
        assert_eq!(first.href, "OEBPS/chap1.xhtml");
        assert_eq!(first.anchor, "");
        assert_eq!(first.level, 1);
        assert_eq!(first.spine_index, Some(0));

        let nested = cache.toc_entry(1);
        assert_eq!(nested.title, "Section 1.1");
        assert_eq!(nested.anchor, "sec11");
        assert_eq!(nested.level, 2);
        assert_eq!(nested.spine_index, Some(0));

        let second = cache.toc_entry(2);
        assert_eq!(second.title, "Chapter 2");
        assert_eq!(second.level, 1);
        assert_eq!(second.spine_index, Some(1));
    }

    #[test]
    fn test_doc_title_text_is_not_a_label() {
        // docTitle/text sits outside navMap and must not leak into entries
        let (storage, count) = build_with_ncx(NCX);
        assert_eq!(count, 3);
        let mut cache = BookCache::open(&storage, "cache").unwrap();
        assert_ne!(cache.toc_entry(0).title, "The Time Machine");
    }

    #[test]
    fn test_unresolvable_target_kept_without_spine_index() {
        let ncx = r#"<ncx><navMap>
  <navPoint><navLabel><text>Ghost</text></navLabel><content src="nowhere.xhtml"/></navPoint>
</navMap></ncx>"#;
        let (storage, count) = build_with_ncx(ncx);
        assert_eq!(count, 1);

        let mut cache = BookCache::open(&storage, "cache").unwrap();
        let entry = cache.toc_entry(0);
        assert_eq!(entry.title, "Ghost");
        assert_eq!(entry.spine_index, None);
    }

    #[test]
    fn test_content_without_src_is_skipped() {
        let ncx = r#"<ncx><navMap>
  <navPoint><navLabel><text>Empty</text></navLabel><content/></navPoint>
  <navPoint><navLabel><text>Real</text></navLabel><content src="chap2.xhtml"/></navPoint>
</navMap></ncx>"#;
        let (storage, count) = build_with_ncx(ncx);
        assert_eq!(count, 1);

        let mut cache = BookCache::open(&storage, "cache").unwrap();
        assert_eq!(cache.toc_entry(0).title, "Real");
    }

    #[test]
    fn test_malformed_ncx_reports_line() {
        let mut archive =
            MemoryArchive::new().with_entry("toc.ncx", "<ncx>\n<navMap>\n</oops>\n</ncx>");
        let storage = MemoryStorage::new();
        let mut builder = BookCacheBuilder::new(&storage, "cache");
        builder.begin_spine_pass().unwrap();
        builder.end_spine_pass().unwrap();
        builder.begin_toc_pass().unwrap();

        let err = parse_ncx_document(&mut archive, &storage, &mut builder, "toc.ncx", "", "cache")
            .unwrap_err();
        match err {
            BookbinError::Parse { line, .. } => assert!(line >= 2, "line was {}", line),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(!storage.exists("cache/toc.ncx.tmp"));
    }

    #[test]
    fn test_split_src() {
        assert_eq!(split_src("ch.xhtml#top"), ("ch.xhtml", "top"));
        assert_eq!(split_src("ch.xhtml"), ("ch.xhtml", ""));
        assert_eq!(split_src("#frag"), ("", "frag"));
    }
}
