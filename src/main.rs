use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::Context;
use clap::Parser;
use beat_this_export::acquire::ensure_checkpoint;
use beat_this_export::config::{DEFAULT_CHECKPOINT_PATH, DEFAULT_MODEL_URL, DEFAULT_OUTPUT_PATH};
use beat_this_export::{ConversionConfig, Converter};

/// Convert a Beat This! PyTorch checkpoint to ONNX format.
#[derive(Parser, Debug)]
#[command(name = "beat-this-export", version, about)]
struct Cli {
    /// Path to the PyTorch checkpoint (.ckpt file), downloaded if not found
    #[arg(default_value = DEFAULT_CHECKPOINT_PATH)]
    checkpoint_path: PathBuf,

    /// Output path for the ONNX model (.onnx file)
    #[arg(default_value = DEFAULT_OUTPUT_PATH)]
    output_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Force download the model checkpoint
    #[arg(long)]
    download: bool,

    /// Where the checkpoint is downloaded from
    #[arg(long, env = "BEAT_THIS_MODEL_URL", default_value = DEFAULT_MODEL_URL)]
    model_url: String,
}

const VERBOSE_FILTER: &str = "beat_this_export=debug,onnx_graph=debug,info";

fn init_logging(verbose: bool) {
    let level = if verbose { VERBOSE_FILTER } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ConversionConfig {
        checkpoint_path: cli.checkpoint_path,
        output_path: cli.output_path,
        model_url: cli.model_url,
        verbose: cli.verbose,
        force_download: cli.download,
        ..ConversionConfig::default()
    };

    ensure_checkpoint(&config)
        .with_context(|| format!("could not acquire {}", config.checkpoint_path.display()))?;

    if !config.checkpoint_path.exists() {
        log::error!("Error: Checkpoint file not found: {}", config.checkpoint_path.display());
        return Ok(ExitCode::FAILURE);
    }

    let report = Converter::new(config).run();
    if !report.success {
        log::error!("Conversion failed!");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
