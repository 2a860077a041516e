//! The conversion run: load, normalize, bind, smoke test, export, verify.

use std::fmt;
use onnx_graph::checker::CheckReport;
use crate::checkpoint::Checkpoint;
use crate::export::{export, ExportOptions};
use crate::model::{BeatThis, INPUT_NAME};
use crate::normalize::normalize_state_dict;
use crate::smoke::{smoke_test, synthetic_input, SmokeReport};
use crate::verify::verify;
use crate::{ConversionConfig, Error};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum Stage {
    Start,
    Acquired,
    Loaded,
    Normalized,
    Bound,
    SmokeTested,
    Exported,
    Verified,
    Done,
    Failed,
}

impl Stage {
    /// What is attempted after reaching this stage.
    fn next_step(&self) -> &'static str {
        match self {
            Stage::Start => "checkpoint lookup",
            Stage::Acquired => "checkpoint loading",
            Stage::Loaded => "key normalization",
            Stage::Normalized => "model loading",
            Stage::Bound => "model test",
            Stage::SmokeTested => "ONNX export",
            Stage::Exported => "ONNX verification",
            Stage::Verified | Stage::Done | Stage::Failed => "conversion",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub success: bool,
    pub stage: Stage,
    pub last_completed: Stage,
    pub error: Option<String>,
    pub smoke: Option<SmokeReport>,
    pub check: Option<CheckReport>,
    pub artifact_bytes: Option<u64>,
}

/// Closing summary of a successful conversion.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInformation {
    pub input_name: String,
    pub input_shape: Vec<usize>,
    pub outputs: Vec<String>,
    pub opset_version: i64,
    pub bytes: u64,
}

impl fmt::Display for ModelInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model Information:")?;
        writeln!(f, "- Input: {} {:?}", self.input_name, self.input_shape)?;
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "- Output {}: {output} predictions", i + 1)?;
        }
        writeln!(f, "- ONNX Opset Version: {}", self.opset_version)?;
        write!(f, "- File size: {:.1} MB", self.bytes as f64 / BYTES_PER_MB)
    }
}

impl RunReport {
    /// Available once every step has produced its result.
    pub fn model_information(&self) -> Option<ModelInformation> {
        let smoke = self.smoke.as_ref()?;
        let check = self.check.as_ref()?;
        Some(ModelInformation {
            input_name: INPUT_NAME.to_string(),
            input_shape: smoke.input_shape.clone(),
            outputs: smoke.outputs.iter().map(|x| x.name.clone()).collect(),
            opset_version: check.opset_version,
            bytes: self.artifact_bytes?,
        })
    }

    fn new() -> Self {
        Self {
            success: false,
            stage: Stage::Start,
            last_completed: Stage::Start,
            error: None,
            smoke: None,
            check: None,
            artifact_bytes: None,
        }
    }
}

pub struct Converter {
    config: ConversionConfig,
    stage: Stage,
}

impl Converter {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config, stage: Stage::Start }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs every step in order, stopping at the first failure.
    ///
    /// Failures are logged and summarized in the report rather than
    /// returned. An artifact written before a failing step is left in place.
    pub fn run(&mut self) -> RunReport {
        let mut report = RunReport::new();
        match self.execute(&mut report) {
            Ok(()) => {
                self.stage = Stage::Done;
                report.success = true;
                log::info!("Conversion completed successfully!");
                log::info!("ONNX model saved to: {}", self.config.output_path.display());
                if let Some(information) = report.model_information() {
                    for line in information.to_string().lines() {
                        log::debug!("{line}");
                    }
                }
            }
            Err(err) => {
                log::error!("Error during {}: {err}", self.stage.next_step());
                report.error = Some(err.to_string());
                if self.stage >= Stage::SmokeTested && self.config.output_path.exists() {
                    log::warn!("{} was left on disk and may be invalid", self.config.output_path.display());
                }
                report.last_completed = self.stage;
                self.stage = Stage::Failed;
            }
        }
        report.stage = self.stage;
        if report.success {
            report.last_completed = Stage::Done;
        }
        report
    }

    fn advance(&mut self, stage: Stage) {
        log::debug!("stage {} -> {stage}", self.stage);
        self.stage = stage;
    }

    fn execute(&mut self, report: &mut RunReport) -> Result<(), Error> {
        let config = self.config.clone();

        log::debug!("Configuration:");
        log::debug!("  - Checkpoint: {}", config.checkpoint_path.display());
        log::debug!("  - Output: {}", config.output_path.display());
        log::debug!("  - Verbose: {}", config.verbose);
        log::info!("Loading checkpoint from: {}", config.checkpoint_path.display());

        if !config.checkpoint_path.exists() {
            return Err(Error::CheckpointLoad {
                path: config.checkpoint_path.clone(),
                message: "Checkpoint file not found".to_string(),
            });
        }
        self.advance(Stage::Acquired);

        let checkpoint = Checkpoint::load(&config.checkpoint_path)?;
        log::info!("Checkpoint loaded successfully");
        log::debug!("  - Keys: {:?}", checkpoint.top_level_keys);
        if let Some(hyper_parameters) = &checkpoint.hyper_parameters {
            log::debug!("  - Hyperparameters: {hyper_parameters}");
        }
        self.advance(Stage::Loaded);

        let state_dict = normalize_state_dict(&checkpoint.state_dict)?;
        drop(checkpoint);
        self.advance(Stage::Normalized);

        let mut model = BeatThis::new(config.model.clone())?;
        model.load_state_dict(state_dict)?;
        model.eval()?;
        log::info!("Model loaded and set to evaluation mode");
        log::debug!("  - Model type: {}", std::any::type_name::<BeatThis>());
        if let Some(device) = model.device() {
            log::debug!("  - Model device: {:?}", device.location());
        }
        log::debug!("  - Model parameters: {}", model.num_parameters());
        self.advance(Stage::Bound);

        let input = synthetic_input(&config)?;
        log::info!("Created dummy input with shape: {:?}", input.dims());
        log::debug!("  - Batch size: {}", input.dims()[0]);
        log::debug!("  - Time frames: {}", input.dims()[1]);
        log::debug!("  - Frequency bins: {}", input.dims()[2]);
        log::debug!("  - Input dtype: {:?}", input.dtype());
        let smoke = smoke_test(&model, &input)?;
        log::info!("Model test successful. Output keys: {:?}", smoke.outputs.iter().map(|x| x.name.as_str()).collect::<Vec<_>>());
        for output in &smoke.outputs {
            log::info!("{} output shape: {:?}", output.name, output.shape);
            log::debug!("  - {output}");
        }
        report.smoke = Some(smoke);
        self.advance(Stage::SmokeTested);

        let options = ExportOptions::default();
        log::info!("Starting ONNX export...");
        log::debug!("  - ONNX opset version: {}", options.opset_version);
        log::debug!("  - Input names: {:?}", options.input_names);
        log::debug!("  - Output names: {:?}", options.output_names);
        log::debug!("  - Dynamic axes: {:?}", options.dynamic_axes);
        let summary = export(&model, &input, &config.output_path, &options)?;
        log::info!("ONNX export completed");
        log::debug!("  - Output file size: {:.1} MB", summary.bytes as f64 / BYTES_PER_MB);
        report.artifact_bytes = Some(summary.bytes);
        self.advance(Stage::Exported);

        log::info!("Verifying ONNX model...");
        let check = verify(&config.output_path)?;
        log::info!("ONNX model verification successful");
        log::debug!("  - Graph nodes: {}", check.node_count);
        log::debug!("  - Graph inputs: {}", check.inputs.len());
        log::debug!("  - Graph outputs: {}", check.outputs.len());
        log::debug!("  - Initializers: {}", check.initializer_count);
        for input in &check.inputs {
            log::debug!("  - Input '{}':", input.name);
            for (i, dim) in input.dims.iter().enumerate() {
                match dim {
                    onnx_graph::checker::DimSummary::Fixed(value) => log::debug!("    - Dimension {i}: {value} (fixed)"),
                    onnx_graph::checker::DimSummary::Dynamic(name) => log::debug!("    - Dimension {i}: {name} (dynamic)"),
                }
            }
        }
        report.check = Some(check);
        self.advance(Stage::Verified);
        Ok(())
    }
}
