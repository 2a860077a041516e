mod common;

use std::process::Command;
use candle_core::{DType, Device, Tensor};
use beat_this_export::checkpoint::StateDict;

fn command() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_beat-this-export"));
    command.env_remove("BEAT_THIS_MODEL_URL").env_remove("RUST_LOG");
    command
}

#[test]
fn missing_checkpoint_and_unreachable_url_exit_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("final0.ckpt");
    let output = dir.path().join("beat_this.onnx");
    let status = command()
        .arg(&checkpoint)
        .arg(&output)
        .arg("--model-url")
        .arg(common::unreachable_url())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(!checkpoint.exists());
    assert!(!output.exists());
}

#[test]
fn download_flag_refetches_existing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("final0.ckpt");
    let output = dir.path().join("beat_this.onnx");
    std::fs::write(&checkpoint, b"stale copy").unwrap();
    let (url, server) = common::serve_once(b"fresh copy".to_vec());

    let status = command()
        .arg(&checkpoint)
        .arg(&output)
        .arg("--download")
        .env("BEAT_THIS_MODEL_URL", &url)
        .status()
        .unwrap();
    server.join().unwrap();

    assert_eq!(std::fs::read(&checkpoint).unwrap(), b"fresh copy");
    // Not a loadable checkpoint, so the run fails after fetching.
    assert_eq!(status.code(), Some(1));
    assert!(!output.exists());
}

#[test]
fn unexpected_key_fails_binding() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("final0.ckpt");
    let output = dir.path().join("beat_this.onnx");
    let mut state = StateDict::new();
    state.insert("model.unexpected.weight".to_string(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap());
    common::write_checkpoint(&checkpoint, &state);

    let result = command()
        .arg(&checkpoint)
        .arg(&output)
        .arg("--verbose")
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(1));
    assert!(!output.exists());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("unexpected.weight"), "{stderr}");
    assert!(stderr.contains("Conversion failed!"), "{stderr}");
}

#[test]
fn verbose_run_reports_configuration_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("final0.ckpt");
    let output = dir.path().join("beat_this.onnx");
    let mut state = StateDict::new();
    state.insert("model.x".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
    common::write_checkpoint(&checkpoint, &state);

    let result = command().arg(&checkpoint).arg(&output).arg("-v").output().unwrap();
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    let position = |needle: &str| stderr.find(needle).unwrap_or_else(|| panic!("missing {needle:?} in {stderr}"));
    let configuration = position("Configuration:");
    position(&format!("  - Checkpoint: {}", checkpoint.display()));
    position(&format!("  - Output: {}", output.display()));
    position("  - Verbose: true");
    let loading = position(&format!("Loading checkpoint from: {}", checkpoint.display()));
    let loaded = position("Checkpoint loaded successfully");
    assert!(configuration < loading && loading < loaded, "{stderr}");
}

#[test]
fn quiet_run_announces_loading_without_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("final0.ckpt");
    let mut state = StateDict::new();
    state.insert("model.x".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
    common::write_checkpoint(&checkpoint, &state);

    let result = command().arg(&checkpoint).arg(dir.path().join("beat_this.onnx")).output().unwrap();
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains(&format!("Loading checkpoint from: {}", checkpoint.display())), "{stderr}");
    assert!(!stderr.contains("Configuration:"), "{stderr}");
}
