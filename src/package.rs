//! Package document (OPF) resolver.
//!
//! Streams the package document through a tagged state machine, building the
//! on-storage manifest and emitting ordered spine entries. The manifest of a
//! large book does not fit in RAM, so (id, resolved href) pairs are appended
//! to a scratch file during the manifest section and resolved by sequential
//! scans during the spine section.
//!
//! This relies on `<spine>` following `<manifest>` in document order, which
//! the EPUB spec's authoring conventions guarantee in practice but the
//! schema does not enforce. A spine that precedes its manifest produces
//! logged resolution misses, never a crash.

use std::io::{Seek, SeekFrom, Write};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::archive::{ArchiveAccessor, DEFAULT_CHUNK_SIZE};
use crate::cache::BookCacheBuilder;
use crate::error::BookbinError;
use crate::serialize::{read_str, write_str};
use crate::storage::BlockStorage;
use crate::streaming;

/// Media type identifying the NCX table of contents in the manifest.
pub const MEDIA_TYPE_NCX: &str = "application/x-dtbncx+xml";

/// Data captured from the package document besides the spine itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageSummary {
    /// Accumulated `dc:title` character data.
    pub title: String,
    /// Resolved href of the cover manifest item, empty if none.
    pub cover_item_href: String,
    /// Resolved href of the NCX document, if the manifest declares one.
    pub toc_ncx_path: Option<String>,
    /// Package base directory ("" or e.g. "OEBPS/"), applied to all hrefs.
    pub base_dir: String,
}

/// Parser position within the package document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpfState {
    Start,
    InPackage,
    InMetadata,
    InTitle,
    InManifest,
    InSpine,
}

/// Structural role of an element name, with bare and `opf:`-prefixed
/// spellings mapped to the same class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElementClass {
    Package,
    Metadata,
    Title,
    Meta,
    Manifest,
    Item,
    Spine,
    ItemRef,
    Other,
}

fn classify(name: &str) -> ElementClass {
    if name == "dc:title" || name == "title" {
        return ElementClass::Title;
    }
    match name.strip_prefix("opf:").unwrap_or(name) {
        "package" => ElementClass::Package,
        "metadata" => ElementClass::Metadata,
        "meta" => ElementClass::Meta,
        "manifest" => ElementClass::Manifest,
        "item" => ElementClass::Item,
        "spine" => ElementClass::Spine,
        "itemref" => ElementClass::ItemRef,
        _ => ElementClass::Other,
    }
}

/// State transition on element start, or `None` to stay put.
fn enter(state: OpfState, class: ElementClass) -> Option<OpfState> {
    match (state, class) {
        (OpfState::Start, ElementClass::Package) => Some(OpfState::InPackage),
        (OpfState::InPackage, ElementClass::Metadata) => Some(OpfState::InMetadata),
        (OpfState::InMetadata, ElementClass::Title) => Some(OpfState::InTitle),
        (OpfState::InPackage, ElementClass::Manifest) => Some(OpfState::InManifest),
        (OpfState::InPackage, ElementClass::Spine) => Some(OpfState::InSpine),
        _ => None,
    }
}

/// State transition on element end, or `None` to stay put.
fn exit(state: OpfState, class: ElementClass) -> Option<OpfState> {
    match (state, class) {
        (OpfState::InPackage, ElementClass::Package) => Some(OpfState::Start),
        (OpfState::InMetadata, ElementClass::Metadata) => Some(OpfState::InPackage),
        (OpfState::InTitle, ElementClass::Title) => Some(OpfState::InMetadata),
        (OpfState::InManifest, ElementClass::Manifest) => Some(OpfState::InPackage),
        (OpfState::InSpine, ElementClass::Spine) => Some(OpfState::InPackage),
        _ => None,
    }
}

/// Package base directory: everything up to and including the last slash.
pub fn base_dir_of(opf_path: &str) -> String {
    match opf_path.rfind('/') {
        Some(idx) => opf_path[..=idx].to_string(),
        None => String::new(),
    }
}

/// Parse the package document at `opf_path`, emitting spine entries into
/// `builder` and returning captured title/cover/NCX metadata.
///
/// `builder` must already be in its spine pass. Fails with
/// [`BookbinError::Parse`] (with line number) on malformed XML, aborting
/// the whole pass; unresolvable `idref`s are warnings only.
pub fn parse_package_document<A, S>(
    archive: &mut A,
    storage: &S,
    builder: &mut BookCacheBuilder<'_, S>,
    opf_path: &str,
    scratch_dir: &str,
) -> Result<PackageSummary, BookbinError>
where
    A: ArchiveAccessor + ?Sized,
    S: BlockStorage,
{
    let opf_scratch = format!("{}/content.opf.tmp", scratch_dir);
    let items_scratch = format!("{}/items.bin.tmp", scratch_dir);

    let result =
        streaming::spool_to_scratch(archive, storage, opf_path, &opf_scratch, DEFAULT_CHUNK_SIZE)
            .and_then(|_| {
                parse_spooled_opf(storage, builder, opf_path, &opf_scratch, &items_scratch)
            });

    streaming::remove_scratch(storage, &opf_scratch);
    streaming::remove_scratch(storage, &items_scratch);
    result
}

fn parse_spooled_opf<S: BlockStorage>(
    storage: &S,
    builder: &mut BookCacheBuilder<'_, S>,
    opf_path: &str,
    opf_scratch: &str,
    items_scratch: &str,
) -> Result<PackageSummary, BookbinError> {
    let mut reader = Reader::from_reader(streaming::open_for_parse(storage, opf_scratch)?);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut state = OpfState::Start;
    let mut summary = PackageSummary {
        base_dir: base_dir_of(opf_path),
        ..PackageSummary::default()
    };
    let mut cover_item_id = String::new();
    let mut items_writer: Option<S::Writer> = None;
    let mut items_reader: Option<S::Reader> = None;

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .unwrap_or_default()
                    .to_string();
                let class = classify(&name);

                if let Some(next) = enter(state, class) {
                    state = next;
                    match state {
                        OpfState::InManifest => {
                            items_writer = Some(storage.open_write(items_scratch, true)?);
                        }
                        OpfState::InSpine => {
                            // The manifest scratch must be complete by now;
                            // a spine that precedes the manifest only gets
                            // logged misses below.
                            items_writer = None;
                            match storage.open_read(items_scratch) {
                                Ok(handle) => items_reader = Some(handle),
                                Err(err) => {
                                    log::warn!(
                                        "manifest scratch unavailable for spine pass: {}",
                                        err
                                    );
                                }
                            }
                        }
                        _ => {}
                    }
                    continue;
                }

                handle_element(
                    &reader,
                    &e,
                    state,
                    &mut summary,
                    &mut cover_item_id,
                    &mut items_writer,
                    &mut items_reader,
                    builder,
                )?;
            }
            Ok(Event::Empty(e)) => {
                handle_element(
                    &reader,
                    &e,
                    state,
                    &mut summary,
                    &mut cover_item_id,
                    &mut items_writer,
                    &mut items_reader,
                    builder,
                )?;
            }
            Ok(Event::Text(e)) => {
                if state == OpfState::InTitle {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    summary.title.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .unwrap_or_default()
                    .to_string();

                if let Some(next) = exit(state, classify(&name)) {
                    match state {
                        OpfState::InManifest => {
                            if let Some(mut writer) = items_writer.take() {
                                writer.flush()?;
                            }
                        }
                        OpfState::InSpine => {
                            items_reader = None;
                        }
                        _ => {}
                    }
                    state = next;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(streaming::parse_error_at(
                    storage,
                    opf_scratch,
                    reader.buffer_position(),
                    format!("package parse error: {:?}", e),
                ));
            }
            _ => {}
        }
    }

    Ok(summary)
}

/// Per-element actions for item, itemref, and meta elements.
#[allow(clippy::too_many_arguments)]
fn handle_element<S, R>(
    reader: &Reader<R>,
    e: &BytesStart<'_>,
    state: OpfState,
    summary: &mut PackageSummary,
    cover_item_id: &mut String,
    items_writer: &mut Option<S::Writer>,
    items_reader: &mut Option<S::Reader>,
    builder: &mut BookCacheBuilder<'_, S>,
) -> Result<(), BookbinError>
where
    S: BlockStorage,
{
    match (state, classify(&element_name(reader, e))) {
        (OpfState::InMetadata, ElementClass::Meta) => {
            let mut is_cover = false;
            let mut content = String::new();
            for attr in e.attributes().flatten() {
                let key = reader
                    .decoder()
                    .decode(attr.key.as_ref())
                    .unwrap_or_default()
                    .to_string();
                let value = reader
                    .decoder()
                    .decode(&attr.value)
                    .unwrap_or_default()
                    .to_string();
                match key.as_str() {
                    "name" if value == "cover" => is_cover = true,
                    "content" => content = value,
                    _ => {}
                }
            }
            if is_cover {
                *cover_item_id = content;
            }
        }
        (OpfState::InManifest, ElementClass::Item) => {
            let mut item_id = String::new();
            let mut href = String::new();
            let mut media_type = String::new();
            for attr in e.attributes().flatten() {
                let key = reader
                    .decoder()
                    .decode(attr.key.as_ref())
                    .unwrap_or_default()
                    .to_string();
                let value = reader
                    .decoder()
                    .decode(&attr.value)
                    .unwrap_or_default()
                    .to_string();
                match key.as_str() {
                    "id" => item_id = value,
                    "href" => href = format!("{}{}", summary.base_dir, value),
                    "media-type" => media_type = value,
                    _ => {}
                }
            }

            if let Some(writer) = items_writer.as_mut() {
                write_str(writer, &item_id)?;
                write_str(writer, &href)?;
            }

            if !cover_item_id.is_empty() && item_id == *cover_item_id {
                summary.cover_item_href = href.clone();
            }

            if media_type == MEDIA_TYPE_NCX {
                if summary.toc_ncx_path.is_none() {
                    summary.toc_ncx_path = Some(href);
                } else {
                    log::warn!("multiple NCX items in manifest; ignoring duplicate {}", href);
                }
            }
        }
        (OpfState::InSpine, ElementClass::ItemRef) => {
            let mut idref = String::new();
            for attr in e.attributes().flatten() {
                let key = reader
                    .decoder()
                    .decode(attr.key.as_ref())
                    .unwrap_or_default();
                if key == "idref" {
                    idref = reader
                        .decoder()
                        .decode(&attr.value)
                        .unwrap_or_default()
                        .to_string();
                }
            }
            if !idref.is_empty() {
                resolve_itemref(&idref, items_reader, builder)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn element_name<R>(reader: &Reader<R>, e: &BytesStart<'_>) -> String {
    reader
        .decoder()
        .decode(e.name().as_ref())
        .unwrap_or_default()
        .to_string()
}

/// Resolve a spine `idref` by linearly scanning the manifest scratch file.
///
/// Each lookup restarts from offset zero; the cost is quadratic in the
/// manifest size but needs no in-memory table.
fn resolve_itemref<S: BlockStorage>(
    idref: &str,
    items_reader: &mut Option<S::Reader>,
    builder: &mut BookCacheBuilder<'_, S>,
) -> Result<(), BookbinError> {
    let reader = match items_reader.as_mut() {
        Some(reader) => reader,
        None => {
            log::warn!("itemref {} seen with no manifest scratch; skipping", idref);
            return Ok(());
        }
    };

    reader.seek(SeekFrom::Start(0))?;
    loop {
        let item_id = match read_str(reader) {
            Ok(id) => id,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        let href = read_str(reader)?;
        if item_id == idref {
            builder.create_spine_entry(&href)?;
            return Ok(());
        }
    }

    // Not fatal: a spine entry is simply not created for this itemref.
    log::warn!("no manifest item found for spine idref {}", idref);
    Ok(())
}
