//! Unified error types for bookbin
//!
//! Provides a single `BookbinError` used across the pipeline, plus `From`
//! impls so `?` works across module boundaries.
//!
//! Resolution misses (a TOC entry whose href matches no spine item, or a
//! spine item with no TOC entry pointing at it) are deliberately *not*
//! errors: EPUBs are not required to have a 1:1 spine/TOC correspondence.
//! Those paths log a warning and persist a `none` index instead.

use core::fmt;

/// Top-level error type for bookbin operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BookbinError {
    /// A required archive entry, cache file, or storage path is missing.
    ///
    /// Always recoverable by falling back to a full rebuild (for cache
    /// files) or by surfacing "book failed to load" (for archive entries).
    NotFound(String),
    /// Malformed XML aborted the current parse pass
    Parse {
        /// 1-based line number in the source document where parsing failed
        line: u32,
        /// Parser diagnostic
        message: String,
    },
    /// The document parsed cleanly but is missing required structure
    /// (e.g. a container with no usable rootfile path)
    Malformed(String),
    /// Storage read/write/seek failure (description only, since
    /// `std::io::Error` is not `Clone`)
    Io(String),
    /// Cache format version differs from the expected value.
    ///
    /// Callers must treat this identically to `NotFound`: discard and
    /// rebuild, never attempt to interpret the unknown layout.
    VersionMismatch {
        /// Version byte this build of the crate writes and understands
        expected: u8,
        /// Version byte found in the cache file header
        found: u8,
    },
}

impl fmt::Display for BookbinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookbinError::NotFound(what) => write!(f, "not found: {}", what),
            BookbinError::Parse { line, message } => {
                write!(f, "parse error at line {}: {}", line, message)
            }
            BookbinError::Malformed(msg) => write!(f, "malformed document: {}", msg),
            BookbinError::Io(msg) => write!(f, "I/O error: {}", msg),
            BookbinError::VersionMismatch { expected, found } => write!(
                f,
                "cache version mismatch: expected {}, got {}",
                expected, found
            ),
        }
    }
}

impl std::error::Error for BookbinError {}

impl From<std::io::Error> for BookbinError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BookbinError::NotFound(err.to_string())
        } else {
            BookbinError::Io(err.to_string())
        }
    }
}

impl BookbinError {
    /// Whether the error should be treated as "no usable cache" by the
    /// orchestrator (rebuild rather than fail).
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            BookbinError::NotFound(_) | BookbinError::VersionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_error() {
        let err = BookbinError::Parse {
            line: 12,
            message: "unexpected end of document".into(),
        };
        assert_eq!(
            format!("{}", err),
            "parse error at line 12: unexpected end of document"
        );
    }

    #[test]
    fn test_version_mismatch_is_cache_miss() {
        let err = BookbinError::VersionMismatch {
            expected: 1,
            found: 9,
        };
        assert!(err.is_cache_miss());
        assert!(BookbinError::NotFound("book.bin".into()).is_cache_miss());
        assert!(!BookbinError::Io("short write".into()).is_cache_miss());
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(BookbinError::from(io), BookbinError::NotFound(_)));

        let io = std::io::Error::other("disk fell off");
        assert!(matches!(BookbinError::from(io), BookbinError::Io(_)));
    }
}
