use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::models::PatchedSite;

#[derive(Debug, Clone, Error)]
pub enum PatchError {
    #[error("{operation} failed for 0x{address:x} (+{length}): {source}")]
    Platform {
        operation: &'static str,
        address: usize,
        length: usize,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Malformed executable image: {0}")]
    Parse(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Function at 0x{address:x} is not referenced by any direct call")]
    NotReferenced { address: usize },

    /// `succeeded` counts every site whose bytes were written, including
    /// one whose protection could not be restored afterwards.
    #[error("Redirected {succeeded} of {total} call sites before failing: {source}")]
    PartialFailure {
        succeeded: usize,
        total: usize,
        patched: Vec<PatchedSite>,
        #[source]
        source: Box<PatchError>,
    },

    #[error("Failed to read executable image from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error(
        "Protection of 0x{address:x} (+{length}) could not be restored and remains in its temporary state: {source}"
    )]
    RestoreFailed {
        address: usize,
        length: usize,
        /// Bytes the range held before a write that completed inside the
        /// window; empty when nothing was written.
        original: Vec<u8>,
        #[source]
        source: Box<PatchError>,
    },

    #[error("Destination 0x{destination:x} is out of rel32 range from call site 0x{site:x}")]
    DisplacementOutOfRange { site: usize, destination: usize },

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

impl PatchError {
    pub(crate) fn platform(
        operation: &'static str,
        address: usize,
        length: usize,
        source: io::Error,
    ) -> Self {
        Self::Platform {
            operation,
            address,
            length,
            source: Arc::new(source),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<object::Error> for PatchError {
    fn from(err: object::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
