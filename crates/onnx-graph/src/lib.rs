pub mod operators;
pub mod weights;
pub mod tensor;
pub mod node;
pub mod pytorch;
pub mod onnx;
pub mod eval;
pub mod checker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use prost::Message;
pub use tensor::{DType, Dimension, InputTensor, Shape, Tensor, TensorData, WeightTensor};
use tensor::NodeTable;
use node::Node;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input shape: {0}")]
    InputShapeError(String),
    #[error("dtype mismatch: {0} vs {1}")]
    DTypeMismatchError(DType, DType),
    #[error("invalid input: {0}")]
    InvalidInputError(String),
    #[error("unsupported dtype {0}")]
    UnsupportedDTypeError(String),
    #[error("tensor name {0} is used more than once")]
    NameConflictError(String),
    #[error("no tensor named {0}")]
    NoSuchTensorError(String),
    #[error("dimension {0} has no fixed extent")]
    UnresolvedDimensionError(String),
    #[error("invalid dtype {0} for this operation")]
    InvalidDTypeError(String),
    #[error("operand data is not known at graph construction time")]
    CannotResolveDataError,
    #[error("weight cache lock poisoned")]
    PoisonedWeightCache,
    #[error("no value supplied for graph input {0}")]
    MissingInputValue(String),
    #[error("{name}: runtime shape {actual:?} does not match declared {expected}")]
    RuntimeShapeMismatch {
        name: String,
        expected: String,
        actual: Vec<usize>
    },
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
    #[error("malformed model: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

/// Model-level fields written around the graph.
#[derive(Clone, Debug)]
pub struct ProtoOptions {
    pub graph_name: String,
    pub producer_name: String,
    pub producer_version: String,
    pub ir_version: i64,
    pub opset_version: i64,
    pub doc_string: String,
}

impl Default for ProtoOptions {
    fn default() -> Self {
        Self {
            graph_name: String::from("main_graph"),
            producer_name: String::from(env!("CARGO_PKG_NAME")),
            producer_version: String::from(env!("CARGO_PKG_VERSION")),
            ir_version: 7,
            opset_version: 14,
            doc_string: String::new(),
        }
    }
}

/// All nodes feeding `outputs`, producers first.
pub fn collect_nodes<'a>(outputs: &'a [(&str, Arc<dyn Tensor>)]) -> NodeTable<'a> {
    let mut table = NodeTable::new();
    for (_, tensor) in outputs {
        tensor.get_nodes(&mut table);
    }
    table
}

pub fn build_proto(
    inputs: &[Arc<InputTensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    options: &ProtoOptions,
) -> Result<onnx::ModelProto, Error> {

    // Get all nodes in graph
    let table = collect_nodes(outputs);

    // Get all tensors in graph, in first-use order
    let mut seen: HashSet<&dyn Tensor> = HashSet::new();
    let mut tensors: Vec<&dyn Tensor> = vec![];
    for tensor in inputs {
        let tensor: &dyn Tensor = tensor.as_ref();
        if seen.insert(tensor) {
            tensors.push(tensor);
        }
    }
    for node in table.nodes() {
        for tensor in node.get_input_tensors().into_iter().chain(node.get_output_tensors()) {
            if seen.insert(tensor) {
                tensors.push(tensor);
            }
        }
    }

    // Assign names to all tensors in graph
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();

    // Assign requested names
    for (name, tensor) in outputs {
        let name = name.to_string();
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name));
        }
        tensor_names.insert(tensor.as_ref(), name);
    }
    for tensor in &tensors {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            let name = name.to_string();
            if !chosen_names.insert(name.clone()) {
                return Err(Error::NameConflictError(name));
            }
            tensor_names.insert(*tensor, name);
        }
    }
    // Assign remaining names
    let mut next_tensor_id = 0;
    for tensor in &tensors {
        if !tensor_names.contains_key(tensor) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(*tensor, name);
        }
    }

    // Node names must be unique too, and must not shadow a tensor name
    let mut node_names: HashSet<String> = HashSet::new();
    let mut nodes = vec![];
    for (i, node) in table.nodes().iter().enumerate() {
        let base = node.get_name().map(|x| x.to_string()).unwrap_or_else(|| format!("{}_{}", node.get_onnx_type(), i));
        let mut name = base.clone();
        let mut suffix = 1;
        while chosen_names.contains(&name) || !node_names.insert(name.clone()) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        nodes.push(node.to_node_proto(Some(name), &tensor_names));
    }

    // Generate initializer blocks
    let mut initializers = vec![];
    let mut value_info = vec![];
    for tensor in &tensors {
        let name = tensor_names[tensor].clone();
        if let Some(initializer) = tensor.get_initializer(name.clone())? {
            initializers.push(initializer);
        }
        else if !tensor.is_input() && !outputs.iter().any(|(_, t)| t.as_ref() == *tensor) {
            value_info.push(tensor.to_value_info_proto(name));
        }
    }

    let graph = onnx::GraphProto {
        name: options.graph_name.clone(),
        node: nodes,
        initializer: initializers,
        doc_string: String::new(),
        input: inputs.iter().map(|tensor| tensor.to_value_info_proto(tensor_names[&(tensor.as_ref() as &dyn Tensor)].clone())).collect(),
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        .. Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version: options.ir_version,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
        }],
        producer_name: options.producer_name.clone(),
        producer_version: options.producer_version.clone(),
        domain: String::new(),
        model_version: 0,
        doc_string: options.doc_string.clone(),
        graph: Some(graph),
        metadata_props: vec![],
    })
}

pub fn encode_model(model: &onnx::ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

pub fn decode_model(bytes: &[u8]) -> Result<onnx::ModelProto, Error> {
    Ok(onnx::ModelProto::decode(bytes)?)
}
