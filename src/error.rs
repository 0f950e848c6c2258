use std::path::PathBuf;

use thiserror::Error;

use crate::build::layout::Region;

/// Everything that aborts a build. Nothing here is retried: partially
/// placed code or data would be unsafe to inject into the target, so the
/// first failure ends the whole build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("module verification failed: {0}")]
    Verify(String),

    #[error("malformed symbol table row at line {line}: {row:?}")]
    MalformedSymbolRow { line: usize, row: String },

    #[error("cannot allocate {size:#x} byte staging buffer for {region} segment")]
    StagingExhausted { region: Region, size: usize },

    #[error("{region} region exhausted: {requested:#x} bytes do not fit below {ceiling:#x}")]
    RegionExhausted {
        region: Region,
        requested: usize,
        ceiling: u64,
    },

    #[error("{region} region free pointer overflowed requesting {requested:#x} bytes")]
    AddressOverflow { region: Region, requested: usize },

    #[error("section {0:?} allocated twice in one build")]
    DuplicateSection(String),

    #[error("section {name:?} of {size:#x} bytes exceeds the {region} reservation")]
    ReservationExceeded {
        name: String,
        region: Region,
        size: usize,
    },

    #[error("unresolved symbol {0:?}: neither pre-existing nor defined by the module")]
    UnresolvedSymbol(String),

    #[error("relocation against {symbol:?} at {site:#x} does not fit in 32 bits")]
    RelocationOutOfRange { symbol: String, site: u64 },

    #[error("function {function:?}: {message}")]
    Codegen { function: String, message: String },

    #[error("unsupported target instruction set {0:?} (only x86_64 is supported)")]
    UnsupportedTarget(String),
}

pub type Result<T> = std::result::Result<T, BuildError>;
