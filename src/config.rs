use std::path::PathBuf;
use crate::model::BeatThisConfig;

pub const DEFAULT_CHECKPOINT_PATH: &str = "final0.ckpt";
pub const DEFAULT_OUTPUT_PATH: &str = "beat_this.onnx";
pub const DEFAULT_MODEL_URL: &str = "https://cloud.cp.jku.at/public.php/dav/files/7ik4RrBKTS273gp/final0.ckpt";

/// Lowest opset providing every operator the traced attention needs.
pub const ONNX_OPSET_VERSION: i64 = 14;
pub const ONNX_IR_VERSION: i64 = 7;

pub const SMOKE_BATCH: usize = 1;
pub const SMOKE_TIME_FRAMES: usize = 300;

/// Everything one conversion run needs, resolved up front.
#[derive(Clone, Debug)]
pub struct ConversionConfig {
    pub checkpoint_path: PathBuf,
    pub output_path: PathBuf,
    pub model_url: String,
    pub verbose: bool,
    pub force_download: bool,
    pub model: BeatThisConfig,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            model_url: DEFAULT_MODEL_URL.to_string(),
            verbose: false,
            force_download: false,
            model: BeatThisConfig::default(),
        }
    }
}

impl ConversionConfig {
    /// Synthetic smoke-test input shape, `(batch, time, frequency)`.
    pub fn smoke_input_shape(&self) -> (usize, usize, usize) {
        (SMOKE_BATCH, SMOKE_TIME_FRAMES, self.model.spect_dim)
    }
}
