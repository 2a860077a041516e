use std::fmt;
use std::path::PathBuf;
use crate::model::ModelState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },
    #[error("failed to load checkpoint {}: {message}", path.display())]
    CheckpointLoad {
        path: PathBuf,
        message: String
    },
    #[error("keys {first:?} and {second:?} both normalize to {normalized:?}")]
    KeyCollision {
        first: String,
        second: String,
        normalized: String
    },
    #[error(transparent)]
    StateDictMismatch(#[from] StateDictMismatch),
    #[error("model is {actual}, but this requires it to be {expected}")]
    ModelState {
        expected: ModelState,
        actual: ModelState
    },
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid export options: {0}")]
    ExportOptions(String),
    #[error("smoke test failed: {0}")]
    SmokeTest(String),
    #[error(transparent)]
    Graph(#[from] onnx_graph::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("exported model is invalid: {0}")]
    Verification(#[from] onnx_graph::checker::CheckError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}

/// Differences between a state dict and the parameters a model expects.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StateDictMismatch {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// `(name, checkpoint shape, model shape)`
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape_mismatches.is_empty()
    }
}

impl std::error::Error for StateDictMismatch {}

impl fmt::Display for StateDictMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted = |keys: &[String]| keys.iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", ");
        write!(f, "Error(s) in loading state_dict for BeatThis:")?;
        if !self.missing.is_empty() {
            write!(f, "\n\tMissing key(s) in state_dict: {}.", quoted(&self.missing))?;
        }
        if !self.unexpected.is_empty() {
            write!(f, "\n\tUnexpected key(s) in state_dict: {}.", quoted(&self.unexpected))?;
        }
        for (name, found, expected) in &self.shape_mismatches {
            write!(f, "\n\tsize mismatch for {name}: copying a param with shape {found:?} from checkpoint, the shape in current model is {expected:?}.")?;
        }
        Ok(())
    }
}
