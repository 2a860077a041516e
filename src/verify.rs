use std::path::Path;
use onnx_graph::checker::{self, CheckReport};
use crate::Error;

/// Re-reads an exported model from disk and checks it is well formed.
pub fn verify(path: &Path) -> Result<CheckReport, Error> {
    let bytes = std::fs::read(path).map_err(Error::io(path))?;
    let model = onnx_graph::decode_model(&bytes)?;
    Ok(checker::check_model(&model)?)
}
