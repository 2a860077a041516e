//! Structural validation of a decoded [`onnx::ModelProto`].

use std::collections::HashSet;
use std::fmt;
use crate::onnx;
use crate::onnx::tensor_proto::{DataLocation, DataType};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("model has no IR version")]
    MissingIrVersion,
    #[error("model does not import the default operator set")]
    MissingDefaultOpset,
    #[error("model has no graph")]
    MissingGraph,
    #[error("node {0} has no op_type")]
    MissingOpType(String),
    #[error("node {node} consumes {input}, which is not a graph input, initializer or earlier node output")]
    UndefinedInput {
        node: String,
        input: String
    },
    #[error("tensor {0} is defined more than once")]
    DuplicateDefinition(String),
    #[error("graph output {0} is not produced by any node")]
    OutputNotProduced(String),
    #[error("initializer {name} holds {actual} bytes, expected {expected}")]
    InitializerSize {
        name: String,
        expected: usize,
        actual: usize
    },
    #[error("initializer {name} has element type {elem_type}")]
    InvalidInitializerType {
        name: String,
        elem_type: i32
    },
    #[error("{0} has no tensor type")]
    MissingType(String),
    #[error("{name} has unknown element type {elem_type}")]
    UnknownElementType {
        name: String,
        elem_type: i32
    },
    #[error("dimension {index} of {name} has neither a value nor a parameter")]
    UnspecifiedDimension {
        name: String,
        index: usize
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum DimSummary {
    Fixed(i64),
    Dynamic(String)
}

impl fmt::Display for DimSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSummary::Fixed(value) => write!(f, "{value}"),
            DimSummary::Dynamic(name) => write!(f, "{name}")
        }
    }
}

#[derive(Clone, Debug)]
pub struct ValueSummary {
    pub name: String,
    pub elem_type: DataType,
    pub dims: Vec<DimSummary>
}

impl fmt::Display for ValueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "{}: {:?}[{}]", self.name, self.elem_type, dims)
    }
}

#[derive(Clone, Debug)]
pub struct CheckReport {
    pub ir_version: i64,
    pub opset_version: i64,
    pub node_count: usize,
    pub initializer_count: usize,
    pub inputs: Vec<ValueSummary>,
    pub outputs: Vec<ValueSummary>
}

fn summarize(value: &onnx::ValueInfoProto) -> Result<ValueSummary, CheckError> {
    let tensor_type = match value.r#type.as_ref().and_then(|x| x.value.as_ref()) {
        Some(onnx::type_proto::Value::TensorType(tensor_type)) => tensor_type,
        None => return Err(CheckError::MissingType(value.name.clone()))
    };
    let elem_type = match DataType::try_from(tensor_type.elem_type) {
        Ok(DataType::Undefined) | Err(_) => return Err(CheckError::UnknownElementType {
            name: value.name.clone(),
            elem_type: tensor_type.elem_type
        }),
        Ok(elem_type) => elem_type
    };
    let mut dims = vec![];
    if let Some(shape) = &tensor_type.shape {
        for (index, dim) in shape.dim.iter().enumerate() {
            use onnx::tensor_shape_proto::dimension::Value;
            dims.push(match &dim.value {
                Some(Value::DimValue(v)) => DimSummary::Fixed(*v),
                Some(Value::DimParam(p)) if !p.is_empty() => DimSummary::Dynamic(p.clone()),
                _ => return Err(CheckError::UnspecifiedDimension { name: value.name.clone(), index })
            });
        }
    }
    Ok(ValueSummary { name: value.name.clone(), elem_type, dims })
}

fn check_initializer(tensor: &onnx::TensorProto) -> Result<(), CheckError> {
    if tensor.data_location == DataLocation::External as i32 {
        return Ok(());
    }
    let elem_type = DataType::try_from(tensor.data_type).ok();
    let element_size = elem_type.and_then(|x| x.element_size()).ok_or_else(|| CheckError::InvalidInitializerType {
        name: tensor.name.clone(),
        elem_type: tensor.data_type
    })?;
    let count: usize = tensor.dims.iter().map(|x| (*x).max(0) as usize).product();
    let (expected, actual) = if !tensor.raw_data.is_empty() {
        (count * element_size, tensor.raw_data.len())
    } else {
        let typed = tensor.float_data.len() + tensor.int32_data.len() + tensor.int64_data.len();
        (count, typed)
    };
    if expected != actual {
        return Err(CheckError::InitializerSize { name: tensor.name.clone(), expected, actual });
    }
    Ok(())
}

/// Checks graph well-formedness: nodes in topological order, every consumed
/// name defined exactly once, every declared output produced.
pub fn check_model(model: &onnx::ModelProto) -> Result<CheckReport, CheckError> {
    if model.ir_version <= 0 {
        return Err(CheckError::MissingIrVersion);
    }
    let opset_version = model.opset_import.iter()
        .find(|x| x.domain.is_empty() || x.domain == "ai.onnx")
        .map(|x| x.version)
        .ok_or(CheckError::MissingDefaultOpset)?;
    let graph = model.graph.as_ref().ok_or(CheckError::MissingGraph)?;

    let mut defined: HashSet<&str> = HashSet::new();
    for input in &graph.input {
        if !defined.insert(input.name.as_str()) {
            return Err(CheckError::DuplicateDefinition(input.name.clone()));
        }
    }
    let mut initializer_names: HashSet<&str> = HashSet::new();
    for initializer in &graph.initializer {
        if !initializer_names.insert(initializer.name.as_str()) {
            return Err(CheckError::DuplicateDefinition(initializer.name.clone()));
        }
        check_initializer(initializer)?;
        // An initializer may double as an overridable graph input.
        defined.insert(initializer.name.as_str());
    }

    for (i, node) in graph.node.iter().enumerate() {
        let node_name = if node.name.is_empty() { format!("#{i}") } else { node.name.clone() };
        if node.op_type.is_empty() {
            return Err(CheckError::MissingOpType(node_name));
        }
        for input in &node.input {
            // Empty names mark omitted optional inputs.
            if !input.is_empty() && !defined.contains(input.as_str()) {
                return Err(CheckError::UndefinedInput { node: node_name, input: input.clone() });
            }
        }
        for output in &node.output {
            if !output.is_empty() && !defined.insert(output.as_str()) {
                return Err(CheckError::DuplicateDefinition(output.clone()));
            }
        }
    }

    let produced: HashSet<&str> = graph.node.iter().flat_map(|x| x.output.iter().map(|x| x.as_str())).collect();
    for output in &graph.output {
        if !produced.contains(output.name.as_str()) && !defined.contains(output.name.as_str()) {
            return Err(CheckError::OutputNotProduced(output.name.clone()));
        }
    }

    Ok(CheckReport {
        ir_version: model.ir_version,
        opset_version,
        node_count: graph.node.len(),
        initializer_count: graph.initializer.len(),
        inputs: graph.input.iter().map(summarize).collect::<Result<_, _>>()?,
        outputs: graph.output.iter().map(summarize).collect::<Result<_, _>>()?,
    })
}
