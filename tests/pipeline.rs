mod common;

use std::collections::HashMap;
use candle_core::{Device, Tensor};
use beat_this_export::checkpoint::Checkpoint;
use beat_this_export::model::{BeatThis, BeatThisConfig, BEAT_OUTPUT, DOWNBEAT_OUTPUT, INPUT_NAME};
use beat_this_export::normalize::normalize_state_dict;
use beat_this_export::{ConversionConfig, Converter, Error, Stage};
use onnx_graph::checker::DimSummary;
use onnx_graph::Dimension;

fn small_model() -> BeatThis {
    BeatThis::new(common::small_config()).unwrap()
}

#[test]
fn checkpoint_round_trips_through_the_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("final0.ckpt");
    let state = common::random_state_dict(&small_model());
    common::write_checkpoint(&path, &common::wrapped(&state));

    let checkpoint = Checkpoint::load(&path).unwrap();
    let mut keys = checkpoint.top_level_keys.clone();
    keys.sort();
    assert_eq!(keys, vec!["epoch", "hyper_parameters", "state_dict"]);
    let hyper_parameters = checkpoint.hyper_parameters.unwrap();
    assert!(hyper_parameters.contains("'lr': 0.0008"));
    assert!(hyper_parameters.contains("'sum_head': True"));

    let normalized = normalize_state_dict(&checkpoint.state_dict).unwrap();
    assert_eq!(normalized.len(), state.len());
    let name = "frontend.stem.conv2d.weight";
    let loaded: Vec<f32> = normalized[name].flatten_all().unwrap().to_vec1().unwrap();
    let written: Vec<f32> = state[name].flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(loaded, written);
    assert_eq!(normalized["frontend.stem.bn1d.num_batches_tracked"].dims(), &[] as &[usize]);
}

#[test]
fn converts_small_checkpoint_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("final0.ckpt");
    let output_path = dir.path().join("beat_this.onnx");
    common::write_checkpoint(&checkpoint_path, &common::wrapped(&common::random_state_dict(&small_model())));

    let config = ConversionConfig {
        checkpoint_path,
        output_path: output_path.clone(),
        model: common::small_config(),
        ..ConversionConfig::default()
    };
    let mut converter = Converter::new(config);
    let report = converter.run();
    assert!(report.success, "conversion failed: {:?}", report.error);
    assert_eq!(report.stage, Stage::Done);
    assert_eq!(converter.stage(), Stage::Done);

    let smoke = report.smoke.as_ref().unwrap();
    assert_eq!(smoke.input_shape, vec![1, 300, 128]);
    assert_eq!(smoke.output(BEAT_OUTPUT).unwrap().shape, vec![1, 300]);
    assert_eq!(smoke.output(DOWNBEAT_OUTPUT).unwrap().shape, vec![1, 300]);

    let check = report.check.as_ref().unwrap();
    assert_eq!(check.opset_version, 14);
    assert_eq!(check.ir_version, 7);
    assert_eq!(check.inputs.len(), 1);
    assert_eq!(check.outputs.len(), 2);
    assert_eq!(check.inputs[0].name, INPUT_NAME);
    assert_eq!(check.inputs[0].dims, vec![DimSummary::Fixed(1), DimSummary::Dynamic("time".to_string()), DimSummary::Fixed(128)]);
    assert_eq!(report.artifact_bytes, Some(std::fs::metadata(&output_path).unwrap().len()));

    let information = report.model_information().unwrap();
    assert_eq!(information.input_name, INPUT_NAME);
    assert_eq!(information.input_shape, vec![1, 300, 128]);
    assert_eq!(information.outputs, vec![BEAT_OUTPUT.to_string(), DOWNBEAT_OUTPUT.to_string()]);
    assert_eq!(information.opset_version, 14);
    assert_eq!(Some(information.bytes), report.artifact_bytes);
}

#[test]
fn traced_graph_runs_at_any_length() {
    let mut model = small_model();
    model.load_state_dict(common::random_state_dict(&model)).unwrap();
    model.eval().unwrap();
    let graph = model.trace(INPUT_NAME, Dimension::dynamic("time")).unwrap();
    let outputs = [(BEAT_OUTPUT, graph.beat), (DOWNBEAT_OUTPUT, graph.downbeat)];
    for frames in [5, 37] {
        let mut inputs = HashMap::new();
        inputs.insert(INPUT_NAME.to_string(), Tensor::randn(0f32, 1f32, (1, frames, 128), &Device::Cpu).unwrap());
        let values = onnx_graph::eval::evaluate(&outputs, &inputs).unwrap();
        assert_eq!(values[BEAT_OUTPUT].dims(), &[1, frames]);
        assert_eq!(values[DOWNBEAT_OUTPUT].dims(), &[1, frames]);
    }
}

#[test]
fn unexpected_key_stops_before_export() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("final0.ckpt");
    let output_path = dir.path().join("beat_this.onnx");
    let mut state = common::random_state_dict(&small_model());
    state.insert("beat_loss.pos_weight".to_string(), Tensor::ones(1, candle_core::DType::F32, &Device::Cpu).unwrap());
    common::write_checkpoint(&checkpoint_path, &common::wrapped(&state));

    let config = ConversionConfig {
        checkpoint_path,
        output_path: output_path.clone(),
        model: common::small_config(),
        ..ConversionConfig::default()
    };
    let report = Converter::new(config).run();
    assert!(!report.success);
    assert_eq!(report.last_completed, Stage::Normalized);
    assert!(report.error.unwrap().contains("beat_loss.pos_weight"));
    assert!(!output_path.exists());
}

#[test]
fn colliding_keys_fail_normalization() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("final0.ckpt");
    let state = common::random_state_dict(&small_model());
    let mut wrapped = common::wrapped(&state);
    wrapped.insert("frontend.linear.bias".to_string(), state["frontend.linear.bias"].clone());
    common::write_checkpoint(&checkpoint_path, &wrapped);

    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert!(matches!(normalize_state_dict(&checkpoint.state_dict), Err(Error::KeyCollision { .. })));
}

#[test]
fn default_architecture_schema() {
    let model = BeatThis::new(BeatThisConfig::default()).unwrap();
    let shape = |name: &str| model.expected_parameters().iter().find(|x| x.name == name).map(|x| x.shape.clone());
    assert_eq!(shape("frontend.stem.bn1d.weight"), Some(vec![128]));
    assert_eq!(shape("frontend.blocks.0.partial.attnF.attn.to_qkv.weight"), Some(vec![96, 32]));
    assert_eq!(shape("frontend.blocks.1.partial.attnT.ff.net.1.weight"), Some(vec![256, 64]));
    assert_eq!(shape("frontend.blocks.2.norm.running_var"), Some(vec![256]));
    assert_eq!(shape("transformer_blocks.layers.0.0.to_gates.weight"), Some(vec![16, 512]));
    assert_eq!(shape("transformer_blocks.layers.5.0.rotary_embed.freqs"), Some(vec![16]));
    assert_eq!(shape("task_heads.beat_downbeat_lin.weight"), Some(vec![2, 512]));
    assert_eq!(shape("transformer_blocks.layers.6.0.norm.gamma"), None);
}
