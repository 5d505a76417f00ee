//! Container locator.
//!
//! Every EPUB carries a fixed entry-point document, `META-INF/container.xml`,
//! whose first `<rootfile full-path="...">` names the package document. This
//! is a one-shot bounded parse: the container is tiny and is never held in
//! memory whole.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::archive::ArchiveAccessor;
use crate::error::BookbinError;
use crate::storage::BlockStorage;
use crate::streaming;

/// Well-known in-archive path of the container document.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Chunk size for spooling the container document.
const CONTAINER_CHUNK_SIZE: usize = 512;

/// Locate the package document path declared by the archive's container.
///
/// Fails with [`BookbinError::NotFound`] when the container entry is absent
/// or unreadable, and [`BookbinError::Malformed`] when parsing finishes
/// without a usable root-document path. The first `full-path` occurrence is
/// authoritative; later rootfile elements are ignored.
pub fn locate_package_document<A, S>(
    archive: &mut A,
    storage: &S,
    scratch_dir: &str,
) -> Result<String, BookbinError>
where
    A: ArchiveAccessor + ?Sized,
    S: BlockStorage,
{
    let scratch_path = format!("{}/container.xml.tmp", scratch_dir);
    let result = streaming::spool_to_scratch(
        archive,
        storage,
        CONTAINER_PATH,
        &scratch_path,
        CONTAINER_CHUNK_SIZE,
    )
    .and_then(|_| parse_container(storage, &scratch_path));
    streaming::remove_scratch(storage, &scratch_path);
    result
}

fn parse_container<S: BlockStorage>(
    storage: &S,
    scratch_path: &str,
) -> Result<String, BookbinError> {
    let mut reader = Reader::from_reader(streaming::open_for_parse(storage, scratch_path)?);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut full_path: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .unwrap_or_default()
                    .to_string();

                if full_path.is_none() && (name == "rootfile" || name.ends_with(":rootfile")) {
                    for attr in e.attributes().flatten() {
                        let key = reader
                            .decoder()
                            .decode(attr.key.as_ref())
                            .unwrap_or_default();
                        if key == "full-path" {
                            let value = reader
                                .decoder()
                                .decode(&attr.value)
                                .unwrap_or_default()
                                .to_string();
                            if !value.is_empty() {
                                full_path = Some(value);
                            }
                            break;
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(streaming::parse_error_at(
                    storage,
                    scratch_path,
                    reader.buffer_position(),
                    format!("container parse error: {:?}", e),
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    full_path
        .ok_or_else(|| BookbinError::Malformed("no usable rootfile path in container".into()))
}
