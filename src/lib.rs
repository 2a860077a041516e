//! Converts a Beat This! training checkpoint into an ONNX model.
//!
//! The checkpoint is read with candle's pickle support, its parameters are
//! bound to an onnx-graph rendition of the network, and the resulting graph
//! is smoke tested, serialized and checked.

pub mod acquire;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod smoke;
pub mod verify;

pub use config::ConversionConfig;
pub use error::Error;
pub use pipeline::{Converter, RunReport, Stage};
