//! Reference CPU evaluation of a graph, one node at a time in dependency order.

use std::collections::HashMap;
use std::sync::Arc;
use crate::{collect_nodes, Error};
use crate::tensor::{Shape, Tensor};

fn check_runtime_shape(name: &str, shape: &Shape, dims: &[usize], bindings: &mut HashMap<String, usize>) -> Result<(), Error> {
    let mismatch = || Error::RuntimeShapeMismatch {
        name: name.to_string(),
        expected: shape.to_string(),
        actual: dims.to_vec()
    };
    if shape.rank() != dims.len() {
        return Err(mismatch());
    }
    for (dim, &actual) in shape.dims.iter().zip(dims) {
        match (dim.value, &dim.name) {
            (Some(expected), _) if expected != actual => return Err(mismatch()),
            (None, Some(param)) => {
                let bound = *bindings.entry(param.clone()).or_insert(actual);
                if bound != actual {
                    return Err(mismatch());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn fetch<'a>(
    tensor: &'a dyn Tensor,
    values: &HashMap<&'a dyn Tensor, candle_core::Tensor>,
    inputs: &HashMap<String, candle_core::Tensor>,
    bindings: &mut HashMap<String, usize>,
) -> Result<candle_core::Tensor, Error> {
    if let Some(value) = values.get(&tensor) {
        return Ok(value.clone());
    }
    if let Some(value) = tensor.resolve_value() {
        return Ok(value);
    }
    if tensor.is_input() {
        let name = tensor.get_name().unwrap_or_default();
        let value = inputs.get(name).ok_or_else(|| Error::MissingInputValue(name.to_string()))?;
        check_runtime_shape(name, tensor.shape(), value.dims(), bindings)?;
        return Ok(value.clone());
    }
    Err(Error::MissingInputValue(tensor.get_name().unwrap_or("<unnamed>").to_string()))
}

/// Evaluates `outputs` given values for every graph input, keyed by input name.
///
/// Runtime shapes are checked against the declared shapes of inputs and of
/// every intermediate, with each named dynamic dimension bound to a single
/// extent for the whole run.
pub fn evaluate(
    outputs: &[(&str, Arc<dyn Tensor>)],
    inputs: &HashMap<String, candle_core::Tensor>,
) -> Result<HashMap<String, candle_core::Tensor>, Error> {
    let table = collect_nodes(outputs);

    let mut remaining_uses: HashMap<&dyn Tensor, usize> = HashMap::new();
    for node in table.nodes() {
        for tensor in node.get_input_tensors() {
            *remaining_uses.entry(tensor).or_default() += 1;
        }
    }

    let mut bindings: HashMap<String, usize> = HashMap::new();
    let mut values: HashMap<&dyn Tensor, candle_core::Tensor> = HashMap::new();
    for node in table.nodes() {
        let input_tensors = node.get_input_tensors();
        let mut input_values = Vec::with_capacity(input_tensors.len());
        for tensor in &input_tensors {
            input_values.push(fetch(*tensor, &values, inputs, &mut bindings)?);
        }
        for tensor in &input_tensors {
            if let Some(uses) = remaining_uses.get_mut(tensor) {
                *uses -= 1;
                if *uses == 0 && !outputs.iter().any(|(_, t)| t.as_ref() == *tensor) {
                    values.remove(tensor);
                }
            }
        }

        let results = node.evaluate(&input_values)?;
        for (tensor, value) in node.get_output_tensors().into_iter().zip(results) {
            let name = node.get_name().unwrap_or(node.get_onnx_type());
            check_runtime_shape(name, tensor.shape(), value.dims(), &mut bindings)?;
            values.insert(tensor, value);
        }
    }

    let mut out = HashMap::new();
    for (name, tensor) in outputs {
        let value = fetch(tensor.as_ref(), &values, inputs, &mut bindings)?;
        out.insert(name.to_string(), value);
    }
    Ok(out)
}
