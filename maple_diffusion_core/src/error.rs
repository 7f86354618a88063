use std::path::PathBuf;

pub type Result<T, E = DiffusionError> = std::result::Result<T, E>;

/// Errors surfaced by the public pipeline API.
///
/// Setup/data-integrity failures (`WeightSize`, `MissingModelFile`, `Vocab`)
/// are unrecoverable: the model directory itself is bad and retrying the same
/// call cannot succeed. `Fetch` failures are recoverable, the caller may retry
/// with a different source.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("weight file `{path}` holds {found} bytes, expected {expected}")]
    WeightSize {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("missing model file `{0}`")]
    MissingModelFile(PathBuf),

    #[error("malformed vocabulary: {0}")]
    Vocab(String),

    #[error("stage handoff mismatch: {0}")]
    Routing(String),

    #[error("model fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] candle_core::Error),
}

/// Failures of the model fetch collaborator. Kept separate so callers can
/// retry a fetch without treating it as a corrupt-model condition.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("model source `{0}` does not exist")]
    MissingSource(PathBuf),

    #[error("failed to extract archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
