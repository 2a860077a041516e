//! Serializing a bound model to an ONNX file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use onnx_graph::onnx;
use onnx_graph::onnx::tensor_shape_proto::dimension::Value as DimValue;
use onnx_graph::{Dimension, ProtoOptions, Tensor};
use crate::config::{ONNX_IR_VERSION, ONNX_OPSET_VERSION};
use crate::model::{BeatThis, BEAT_OUTPUT, DOWNBEAT_OUTPUT, INPUT_NAME};
use crate::Error;

// Unsqueeze-with-axes-input and last-axis Softmax need at least opset 13.
const MIN_OPSET_VERSION: i64 = 13;
const TIME_AXIS: usize = 1;

/// Tensor name to `axis -> symbolic dimension name`.
pub type DynamicAxes = BTreeMap<String, BTreeMap<usize, String>>;

#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub opset_version: i64,
    pub ir_version: i64,
    pub dynamic_axes: DynamicAxes,
}

impl Default for ExportOptions {
    fn default() -> Self {
        let time_axis = || BTreeMap::from([(TIME_AXIS, "time".to_string())]);
        Self {
            input_names: vec![INPUT_NAME.to_string()],
            output_names: vec![BEAT_OUTPUT.to_string(), DOWNBEAT_OUTPUT.to_string()],
            opset_version: ONNX_OPSET_VERSION,
            ir_version: ONNX_IR_VERSION,
            dynamic_axes: DynamicAxes::from([
                (INPUT_NAME.to_string(), time_axis()),
                (BEAT_OUTPUT.to_string(), time_axis()),
                (DOWNBEAT_OUTPUT.to_string(), time_axis()),
            ]),
        }
    }
}

impl ExportOptions {
    fn validate(&self) -> Result<(), Error> {
        if self.input_names.len() != 1 {
            return Err(Error::ExportOptions(format!("the model takes 1 input, {} names given", self.input_names.len())));
        }
        if self.output_names.len() != 2 {
            return Err(Error::ExportOptions(format!("the model has 2 outputs, {} names given", self.output_names.len())));
        }
        if self.output_names[0] == self.output_names[1] || self.output_names.contains(&self.input_names[0]) {
            return Err(Error::ExportOptions("input and output names must be distinct".to_string()));
        }
        if self.opset_version < MIN_OPSET_VERSION {
            return Err(Error::ExportOptions(format!("opset {} is older than the minimum {MIN_OPSET_VERSION}", self.opset_version)));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ExportSummary {
    pub bytes: u64,
    pub node_count: usize,
    pub initializer_count: usize,
}

fn value_infos_mut<'a>(graph: &'a mut onnx::GraphProto, name: &str) -> Option<&'a mut onnx::ValueInfoProto> {
    graph.input.iter_mut().chain(graph.output.iter_mut()).find(|x| x.name == name)
}

fn shape_mut(value: &mut onnx::ValueInfoProto) -> Option<&mut onnx::TensorShapeProto> {
    match value.r#type.as_mut()?.value.as_mut()? {
        onnx::type_proto::Value::TensorType(tensor) => tensor.shape.as_mut(),
    }
}

/// Names the declared dynamic axes on the graph's inputs and outputs.
///
/// Only axes the traced graph actually left symbolic can be renamed; a
/// fixed extent cannot be made dynamic after the fact.
fn apply_dynamic_axes(graph: &mut onnx::GraphProto, dynamic_axes: &DynamicAxes) -> Result<(), Error> {
    for (name, axes) in dynamic_axes {
        let Some(value) = value_infos_mut(graph, name) else {
            log::warn!("dynamic axes given for {name}, which is not a graph input or output");
            continue;
        };
        let Some(shape) = shape_mut(value) else {
            return Err(Error::ExportOptions(format!("{name} has no shape")));
        };
        let rank = shape.dim.len();
        for (&axis, dim_name) in axes {
            let dim = shape.dim.get_mut(axis).ok_or_else(|| {
                Error::ExportOptions(format!("axis {axis} is out of range for {name} of rank {rank}"))
            })?;
            if !matches!(dim.value, Some(DimValue::DimParam(_))) {
                return Err(Error::ExportOptions(format!("axis {axis} of {name} has a fixed extent")));
            }
            dim.value = Some(DimValue::DimParam(dim_name.clone()));
        }
    }
    Ok(())
}

/// Traces `model` and writes it to `path`.
///
/// `sample` fixes every extent that is not listed in the input's dynamic axes;
/// only the time axis of the input may be dynamic.
pub fn export(model: &BeatThis, sample: &candle_core::Tensor, path: &Path, options: &ExportOptions) -> Result<ExportSummary, Error> {
    options.validate()?;
    let (batch, frames, bins) = sample.dims3()?;
    if batch != 1 || bins != model.config().spect_dim {
        return Err(Error::InvalidInput(format!("sample input {:?} is not (1, time, {})", sample.dims(), model.config().spect_dim)));
    }

    let input_name = &options.input_names[0];
    let input_axes = options.dynamic_axes.get(input_name);
    if let Some(axis) = input_axes.and_then(|x| x.keys().find(|&&axis| axis != TIME_AXIS)) {
        return Err(Error::ExportOptions(format!("only axis {TIME_AXIS} of {input_name} can be dynamic, not axis {axis}")));
    }
    let time = match input_axes.and_then(|x| x.get(&TIME_AXIS)) {
        Some(dim_name) => Dimension::dynamic(dim_name),
        None => Dimension::fixed(frames),
    };

    let graph = model.trace(input_name, time)?;
    let outputs: [(&str, Arc<dyn Tensor>); 2] = [
        (options.output_names[0].as_str(), graph.beat),
        (options.output_names[1].as_str(), graph.downbeat),
    ];
    let proto_options = ProtoOptions {
        ir_version: options.ir_version,
        opset_version: options.opset_version,
        doc_string: "Beat This! beat and downbeat tracker".to_string(),
        .. ProtoOptions::default()
    };
    let mut proto = onnx_graph::build_proto(&[graph.input], &outputs, &proto_options)?;
    let Some(graph_proto) = proto.graph.as_mut() else {
        return Err(Error::ExportOptions("traced model has no graph".to_string()));
    };
    apply_dynamic_axes(graph_proto, &options.dynamic_axes)?;
    let node_count = graph_proto.node.len();
    let initializer_count = graph_proto.initializer.len();

    let bytes = onnx_graph::encode_model(&proto);
    std::fs::write(path, &bytes).map_err(Error::io(path))?;
    Ok(ExportSummary {
        bytes: bytes.len() as u64,
        node_count,
        initializer_count,
    })
}
