//! Graph fragments equivalent to common `torch.nn` modules, reading their
//! parameters through a [`WeightManager`] scoped to the module's prefix.

use std::sync::Arc;
use crate::{operators, Error};
use crate::operators::{Binary, Constant, WhichBinaryOperation, WhichUnaryOperation};
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorData};
use crate::weights::WeightManager;

fn node_name(weight_manager: &impl WeightManager, suffix: &str) -> Option<String> {
    weight_manager.get_prefix().map(|x| format!("{x}.{suffix}"))
}

pub fn constant_f32(value: f32) -> Arc<dyn Tensor> {
    Constant::new(None, TensorData::scalar(value))
}

pub fn constant_i64(value: i64) -> Arc<dyn Tensor> {
    Constant::new(None, TensorData::scalar(value))
}

pub fn constant_i64_vec(values: Vec<i64>) -> Arc<dyn Tensor> {
    Constant::new(None, TensorData::vector(values))
}

/// `nn.Linear`: `x · Wᵀ + b`, bias optional.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let weight = operators::Transpose::new(None, weight_manager.get_tensor("weight")?, Some(vec![1, 0]))?;
    let mat_out = operators::MatMul::new(node_name(weight_manager, "matmul"), input, weight)?;

    if weight_manager.has_tensor("bias") {
        let bias = weight_manager.get_tensor("bias")?;
        Ok(Binary::new(node_name(weight_manager, "add_bias"), WhichBinaryOperation::Add, mat_out, bias)?)
    } else {
        Ok(mat_out)
    }
}

/// `nn.BatchNorm1d`/`nn.BatchNorm2d` in eval mode, channels on axis 1.
pub fn batch_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::BatchNormalization::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias")?,
        weight_manager.get_tensor("running_mean")?,
        weight_manager.get_tensor("running_var")?,
        epsilon,
        // torch momentum 0.1 expressed the ONNX way
        0.9
    )?)
}

/// `nn.Conv2d` with explicit strides and `[top, left, bottom, right]` padding.
pub fn conv2d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, strides: [usize; 2], pads: [usize; 4]) -> Result<Arc<dyn Tensor>, Error> {
    let bias = if weight_manager.has_tensor("bias") {
        Some(weight_manager.get_tensor("bias")?)
    } else {
        None
    };
    Ok(operators::Conv::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        bias,
        strides,
        pads
    )?)
}

/// Exact GELU, `x · ½(1 + erf(x/√2))`.
pub fn gelu(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let scaled = operators::div(input.clone(), constant_f32(std::f32::consts::SQRT_2))?;
    let erf = operators::Unary::new(None, WhichUnaryOperation::Erf, scaled)?;
    let one_plus = operators::add(erf, constant_f32(1.0))?;
    let half = operators::mul(one_plus, constant_f32(0.5))?;
    Ok(operators::mul(input, half)?)
}

/// L2-normalize the last axis, then scale by `√dim · gamma`.
pub fn rms_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let dim = input.shape().dim(-1).resolve()?;
    let norm = operators::ReduceL2::new(None, input.clone(), &[-1], true)?;
    let norm = Binary::new(None, WhichBinaryOperation::Max, norm, constant_f32(1e-12))?;
    let normalized = operators::div(input, norm)?;
    let scaled = operators::mul(normalized, constant_f32((dim as f32).sqrt()))?;
    Ok(Binary::new(node_name(weight_manager, "scale"), WhichBinaryOperation::Mul, scaled, weight_manager.get_tensor("gamma")?)?)
}

/// Reshape to `dims`; at most one dimension may be dynamic and is emitted as `-1`.
pub fn reshape(input: Arc<dyn Tensor>, dims: Vec<Arc<Dimension>>) -> Result<Arc<dyn Tensor>, Error> {
    let target = dims.iter().map(|dim| match dim.value {
        Some(value) => value as i64,
        None => -1
    }).collect::<Vec<_>>();
    Ok(operators::Reshape::new(None, input, constant_i64_vec(target), Shape::new(dims))?)
}

pub fn transpose(input: Arc<dyn Tensor>, perm: &[usize]) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Transpose::new(None, input, Some(perm.to_vec()))?)
}

pub fn unsqueeze(input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Unsqueeze::new(None, input, constant_i64_vec(vec![axis]))?)
}

/// `x[..., index, ...]` along `axis`, dropping that axis.
pub fn select(input: Arc<dyn Tensor>, axis: i64, index: i64) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Gather::new(None, input, constant_i64(index), axis)?)
}

/// `[0, n)` as f32, where `n` is the (possibly dynamic) extent of `input` along `axis`.
pub fn positions(input: Arc<dyn Tensor>, axis: usize) -> Result<Arc<dyn Tensor>, Error> {
    let length = input.shape()[axis].clone();
    let limit: Arc<dyn Tensor> = match length.value {
        Some(value) => constant_i64(value as i64),
        None => {
            let shape = operators::ShapeOf::new(None, input);
            operators::Gather::new(None, shape, constant_i64(axis as i64), 0)?
        }
    };
    let range = operators::Range::new(None, constant_i64(0), limit, constant_i64(1), length)?;
    Ok(operators::Cast::new(None, range, DType::F32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::weights::TensorMapWeightManager;
    use crate::tensor::InputTensor;

    #[test]
    fn linear_without_bias_stops_at_matmul() {
        let mut map = BTreeMap::new();
        map.insert("proj.weight".to_string(), candle_core::Tensor::zeros((3, 5), candle_core::DType::F32, &candle_core::Device::Cpu).unwrap());
        let wm = TensorMapWeightManager::new(Arc::new(map)).prefix("proj");
        let x = InputTensor::new("x".to_string(), DType::F32, Shape::from(vec![2usize, 5]));
        let y = linear(&wm, x).unwrap();
        assert_eq!(y.get_producer().unwrap().get_onnx_type(), "MatMul");
        assert_eq!(y.shape().resolve().unwrap(), vec![2, 3]);
    }

    #[test]
    fn reshape_emits_inferred_dimension_for_dynamic_axis() {
        let time = Dimension::dynamic("time");
        let x = InputTensor::new("x".to_string(), DType::F32, Shape::new(vec![Dimension::fixed(1), time.clone(), Dimension::fixed(6)]));
        let y = reshape(x, vec![time.clone(), Dimension::fixed(2), Dimension::fixed(3)]).unwrap();
        assert!(Arc::ptr_eq(&y.shape()[0], &time));
        assert!(reshape(y, vec![time.clone(), Dimension::dynamic("other")]).is_err());
    }

    #[test]
    fn positions_use_shape_for_dynamic_length() {
        let time = Dimension::dynamic("time");
        let x = InputTensor::new("x".to_string(), DType::F32, Shape::new(vec![time.clone(), Dimension::fixed(4)]));
        let pos = positions(x, 0).unwrap();
        assert_eq!(pos.dtype(), DType::F32);
        assert!(Arc::ptr_eq(&pos.shape()[0], &time));
    }
}
