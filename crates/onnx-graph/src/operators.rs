use std::sync::Arc;
use candle_core::Device;
use crate::Error;
use crate::node::{attributes, Node, SingleOutputNode};
use crate::onnx;
use crate::tensor::{normalize_axis, DType, Dimension, Shape, Tensor, TensorData};

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if dtype != DType::I64 && dtype != DType::I32 {
        return Err(Error::InvalidDTypeError(dtype.to_string()));
    }
    Ok(())
}

fn constant_ints(tensor: &dyn Tensor) -> Result<Vec<i64>, Error> {
    tensor.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()
}

#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display)]
pub enum WhichBinaryOperation {
    Add,
    Sub,
    Mul,
    Div,
    Max
}

/// Elementwise binary operation with numpy-style broadcasting.
pub struct Binary {
    name: Option<String>,
    which: WhichBinaryOperation,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Binary {
    pub fn new(name: Option<String>, which: WhichBinaryOperation, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
        }
        let output_shape = Shape::broadcast(a.shape(), b.shape())?;
        Ok(Arc::new(Self { name, which, a, b, output_shape }))
    }
}

impl Node for Binary {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        match self.which {
            WhichBinaryOperation::Add => "Add",
            WhichBinaryOperation::Sub => "Sub",
            WhichBinaryOperation::Mul => "Mul",
            WhichBinaryOperation::Div => "Div",
            WhichBinaryOperation::Max => "Max",
        }
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let (a, b) = (&inputs[0], &inputs[1]);
        let out = match self.which {
            WhichBinaryOperation::Add => a.broadcast_add(b)?,
            WhichBinaryOperation::Sub => a.broadcast_sub(b)?,
            WhichBinaryOperation::Mul => a.broadcast_mul(b)?,
            WhichBinaryOperation::Div => a.broadcast_div(b)?,
            WhichBinaryOperation::Max => a.broadcast_maximum(b)?,
        };
        Ok(vec![out])
    }
}

impl SingleOutputNode for Binary {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

pub fn add(a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Binary>, Error> {
    Binary::new(None, WhichBinaryOperation::Add, a, b)
}

pub fn mul(a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Binary>, Error> {
    Binary::new(None, WhichBinaryOperation::Mul, a, b)
}

pub fn div(a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Binary>, Error> {
    Binary::new(None, WhichBinaryOperation::Div, a, b)
}

#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display)]
pub enum WhichUnaryOperation {
    Sigmoid,
    Erf,
    Neg,
    Cos,
    Sin,
    Sqrt,
    Exp
}

pub struct Unary {
    name: Option<String>,
    which: WhichUnaryOperation,
    input: Arc<dyn Tensor>
}

impl Unary {
    pub fn new(name: Option<String>, which: WhichUnaryOperation, input: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if !input.dtype().is_float() {
            return Err(Error::InvalidDTypeError(input.dtype().to_string()));
        }
        Ok(Arc::new(Self { name, which, input }))
    }
}

impl Node for Unary {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        match self.which {
            WhichUnaryOperation::Sigmoid => "Sigmoid",
            WhichUnaryOperation::Erf => "Erf",
            WhichUnaryOperation::Neg => "Neg",
            WhichUnaryOperation::Cos => "Cos",
            WhichUnaryOperation::Sin => "Sin",
            WhichUnaryOperation::Sqrt => "Sqrt",
            WhichUnaryOperation::Exp => "Exp",
        }
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let x = &inputs[0];
        let out = match self.which {
            WhichUnaryOperation::Sigmoid => x.neg()?.exp()?.affine(1.0, 1.0)?.recip()?,
            WhichUnaryOperation::Erf => x.erf()?,
            WhichUnaryOperation::Neg => x.neg()?,
            WhichUnaryOperation::Cos => x.cos()?,
            WhichUnaryOperation::Sin => x.sin()?,
            WhichUnaryOperation::Sqrt => x.sqrt()?,
            WhichUnaryOperation::Exp => x.exp()?,
        };
        Ok(vec![out])
    }
}

impl SingleOutputNode for Unary {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_dtype: DType,
    output_shape: Shape
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
        }
        if a.rank() < 2 || b.rank() < 2 {
            return Err(Error::InputShapeError(format!("matmul of {} and {}", a.shape(), b.shape())));
        }
        let a_shape = a.shape();
        let b_shape = b.shape();

        // Validate shapes
        if a_shape.dim(-1).as_ref() != b_shape.dim(-2).as_ref() {
            return Err(Error::InputShapeError(format!("matmul of {} and {}", a_shape, b_shape)));
        }

        // Batch dims broadcast, matrix dims come from each side
        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = Shape::broadcast(&a_batch, &b_batch)?.dims;
        output_dims.push(a_shape.dim(-2).clone());
        output_dims.push(b_shape.dim(-1).clone());

        let output_dtype = a.dtype();
        let output_shape = Shape::new(output_dims);
        Ok(Arc::new(MatMul {
            name,
            a,
            b,
            output_dtype,
            output_shape
        }))
    }
}

impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let a = inputs[0].contiguous()?;
        let b = inputs[1].contiguous()?;
        Ok(vec![a.broadcast_matmul(&b)?])
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Vec<usize>,
    output_shape: Shape
}

impl Transpose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<usize>>) -> Result<Arc<Self>, Error> {
        let perm = perm.unwrap_or_else(|| (0..input.rank()).rev().collect());
        let output_shape = input.shape().permute(&perm)?;
        Ok(Arc::new(Self { name, input, perm, output_shape }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        let perm: Vec<i64> = self.perm.iter().map(|x| *x as i64).collect();
        vec![attributes::ints("perm", &perm)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        Ok(vec![inputs[0].permute(self.perm.clone())?.contiguous()?])
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Reshape to a target given as an I64 constant; `-1` marks the single
/// inferred dimension and `0` copies the input dimension at that position.
pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>, output_shape: Shape) -> Result<Arc<Self>, Error> {
        validate_index_dtype(shape.dtype())?;
        let target = constant_ints(shape.as_ref())?;
        if target.len() != output_shape.rank() {
            return Err(Error::InputShapeError(format!("reshape target {target:?} does not match {output_shape}")));
        }
        if target.iter().filter(|x| **x == -1).count() > 1 {
            return Err(Error::InputShapeError(format!("reshape target {target:?} has more than one inferred dimension")));
        }
        if let (Ok(a), Ok(b)) = (input.shape().num_elements(), output_shape.num_elements()) {
            if a != b {
                return Err(Error::InputShapeError(format!("cannot reshape {} into {}", input.shape(), output_shape)));
            }
        }
        Ok(Arc::new(Self { name, input, shape, output_shape }))
    }
}

pub(crate) fn resolve_reshape_target(input_dims: &[usize], target: &[i64]) -> Result<Vec<usize>, Error> {
    let total: usize = input_dims.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 => {
                inferred = Some(i);
                dims.push(1);
            }
            0 => dims.push(*input_dims.get(i).ok_or_else(|| Error::InputShapeError(format!("reshape {target:?} copies missing axis {i}")))?),
            t if t > 0 => dims.push(t as usize),
            _ => return Err(Error::InputShapeError(format!("invalid reshape target {target:?}")))
        }
    }
    if let Some(i) = inferred {
        let known: usize = dims.iter().product();
        if known == 0 || total % known != 0 {
            return Err(Error::InputShapeError(format!("cannot reshape {input_dims:?} into {target:?}")));
        }
        dims[i] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(Error::InputShapeError(format!("cannot reshape {input_dims:?} into {target:?}")));
    }
    Ok(dims)
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let target: Vec<i64> = inputs[1].to_dtype(candle_core::DType::I64)?.to_vec1()?;
        let dims = resolve_reshape_target(inputs[0].dims(), &target)?;
        Ok(vec![inputs[0].reshape(dims)?])
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Unsqueeze {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Unsqueeze {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        validate_index_dtype(axes.dtype())?;
        let axes_values = constant_ints(axes.as_ref())?;
        let output_rank = input.rank() + axes_values.len();
        let mut normalized = axes_values.iter().map(|x| normalize_axis(*x, output_rank)).collect::<Result<Vec<_>, _>>()?;
        normalized.sort();
        let mut output_shape = input.shape().clone();
        for axis in normalized {
            output_shape.dims.insert(axis, Dimension::fixed(1));
        }
        Ok(Arc::new(Self { name, input, axes, output_shape }))
    }
}

impl Node for Unsqueeze {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.axes.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Unsqueeze"
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let axes: Vec<i64> = inputs[1].to_dtype(candle_core::DType::I64)?.to_vec1()?;
        let output_rank = inputs[0].rank() + axes.len();
        let mut normalized = axes.iter().map(|x| normalize_axis(*x, output_rank)).collect::<Result<Vec<_>, _>>()?;
        normalized.sort();
        let mut out = inputs[0].clone();
        for axis in normalized {
            out = out.unsqueeze(axis)?;
        }
        Ok(vec![out])
    }
}

impl SingleOutputNode for Unsqueeze {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: usize,
    output_shape: Shape,
    dtype: DType
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        validate_index_dtype(indices.dtype())?;
        let axis = data.shape().normalize_axis(axis)?;
        let data_shape = data.shape();
        let mut output_dims = data_shape.dims[..axis].to_vec();
        output_dims.extend_from_slice(&indices.shape().dims);
        output_dims.extend_from_slice(&data_shape.dims[axis + 1..]);
        let dtype = data.dtype();
        Ok(Arc::new(Self {
            name,
            data,
            indices,
            axis,
            output_shape: Shape::new(output_dims),
            dtype
        }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Gather"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attributes::int("axis", self.axis as i64)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let (data, indices) = (&inputs[0], &inputs[1]);
        let axis_len = data.dim(self.axis)? as i64;
        let raw: Vec<i64> = indices.flatten_all()?.to_dtype(candle_core::DType::I64)?.to_vec1()?;
        let mut selected = Vec::with_capacity(raw.len());
        for index in raw {
            let index = if index < 0 { index + axis_len } else { index };
            if index < 0 || index >= axis_len {
                return Err(Error::InvalidInputError(format!("gather index {index} out of range {axis_len}")));
            }
            selected.push(index as u32);
        }
        let ids = candle_core::Tensor::new(selected.as_slice(), data.device())?;
        let out = data.contiguous()?.index_select(&ids, self.axis)?;
        let mut out_dims = data.dims()[..self.axis].to_vec();
        out_dims.extend_from_slice(indices.dims());
        out_dims.extend_from_slice(&data.dims()[self.axis + 1..]);
        Ok(vec![out.reshape(out_dims)?])
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct Concat {
    name: Option<String>,
    inputs: Vec<Arc<dyn Tensor>>,
    axis: usize,
    output_shape: Shape,
    output_dtype: DType
}

impl Concat {
    pub fn new(name: Option<String>, inputs: Vec<Arc<dyn Tensor>>, axis: i64) -> Result<Arc<Self>, Error> {
        if inputs.is_empty() {
            return Err(Error::InvalidInputError("concat of no inputs".to_string()));
        }
        for input in &inputs {
            if input.dtype() != inputs[0].dtype() {
                return Err(Error::DTypeMismatchError(inputs[0].dtype(), input.dtype()));
            }
            if input.rank() != inputs[0].rank() {
                return Err(Error::InputShapeError(format!("concat of {} and {}", inputs[0].shape(), input.shape())));
            }
        }
        let u_axis = inputs[0].shape().normalize_axis(axis)?;

        let output_dtype = inputs[0].dtype();
        let mut output_dims = vec![];
        for i in 0..inputs[0].rank() {
            if i == u_axis {
                let mut v = 0;
                for input in &inputs {
                    v += input.shape()[i].resolve()?;
                }
                output_dims.push(Dimension::fixed(v));
            }
            else {
                let first = &inputs[0].shape()[i];
                for input in &inputs {
                    if input.shape()[i].as_ref() != first.as_ref() {
                        return Err(Error::InputShapeError(format!("concat of {} and {}", inputs[0].shape(), input.shape())));
                    }
                }
                output_dims.push(first.clone());
            }
        }
        let output_shape = Shape::new(output_dims);
        Ok(Arc::new(Self {
            name,
            inputs,
            axis: u_axis,
            output_dtype,
            output_shape
        }))
    }
}

impl Node for Concat {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        self.inputs.iter().map(|x| x.as_ref()).collect()
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Concat"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attributes::int("axis", self.axis as i64)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let refs: Vec<&candle_core::Tensor> = inputs.iter().collect();
        Ok(vec![candle_core::Tensor::cat(&refs, self.axis)?])
    }
}

impl SingleOutputNode for Concat {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: usize
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        let axis = input.shape().normalize_axis(axis)?;
        Ok(Arc::new(Self { name, input, axis }))
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attributes::int("axis", self.axis as i64)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let x = &inputs[0];
        let max = x.max_keepdim(self.axis)?;
        let e = x.broadcast_sub(&max)?.exp()?;
        let sum = e.sum_keepdim(self.axis)?;
        Ok(vec![e.broadcast_div(&sum)?])
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct ReduceL2 {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Vec<usize>,
    keepdims: bool,
    output_shape: Shape
}

impl ReduceL2 {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: &[i64], keepdims: bool) -> Result<Arc<Self>, Error> {
        let mut axes = axes.iter().map(|x| input.shape().normalize_axis(*x)).collect::<Result<Vec<_>, _>>()?;
        axes.sort();
        axes.dedup();
        let mut dims = vec![];
        for (i, dim) in input.shape().dims.iter().enumerate() {
            if !axes.contains(&i) {
                dims.push(dim.clone());
            } else if keepdims {
                dims.push(Dimension::fixed(1));
            }
        }
        Ok(Arc::new(Self { name, input, axes, keepdims, output_shape: Shape::new(dims) }))
    }
}

impl Node for ReduceL2 {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "ReduceL2"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        let axes: Vec<i64> = self.axes.iter().map(|x| *x as i64).collect();
        vec![attributes::ints("axes", &axes), attributes::int("keepdims", self.keepdims as i64)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let mut out = inputs[0].sqr()?;
        for &axis in &self.axes {
            out = out.sum_keepdim(axis)?;
        }
        let mut out = out.sqrt()?;
        if !self.keepdims {
            for &axis in self.axes.iter().rev() {
                out = out.squeeze(axis)?;
            }
        }
        Ok(vec![out])
    }
}

impl SingleOutputNode for ReduceL2 {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// 2D convolution over `(batch, channels, height, width)` inputs.
pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    strides: [usize; 2],
    pads: [usize; 4],
    kernel_shape: [usize; 2],
    output_shape: Shape
}

impl Conv {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, strides: [usize; 2], pads: [usize; 4]) -> Result<Arc<Self>, Error> {
        if input.dtype() != weight.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), weight.dtype()));
        }
        if input.rank() != 4 || weight.rank() != 4 {
            return Err(Error::InputShapeError(format!("conv of {} with kernel {}", input.shape(), weight.shape())));
        }
        let weight_dims = weight.shape().resolve()?;
        if input.shape()[1].as_ref() != weight.shape()[1].as_ref() {
            return Err(Error::InputShapeError(format!("conv of {} with kernel {}", input.shape(), weight.shape())));
        }
        let kernel_shape = [weight_dims[2], weight_dims[3]];
        let mut output_dims = vec![input.shape()[0].clone(), weight.shape()[0].clone()];
        for i in 0..2 {
            let dim = &input.shape()[2 + i];
            let padding = pads[i] + pads[2 + i];
            output_dims.push(match dim.value {
                Some(extent) => {
                    if extent + padding < kernel_shape[i] {
                        return Err(Error::InputShapeError(format!("conv kernel {:?} larger than input {}", kernel_shape, input.shape())));
                    }
                    Dimension::fixed((extent + padding - kernel_shape[i]) / strides[i] + 1)
                }
                // A dynamic extent survives only when the convolution preserves it.
                None if strides[i] == 1 && padding + 1 == kernel_shape[i] => dim.clone(),
                None => return Err(Error::UnresolvedDimensionError(dim.to_string()))
            });
        }
        Ok(Arc::new(Self {
            name,
            input,
            weight,
            bias,
            strides,
            pads,
            kernel_shape,
            output_shape: Shape::new(output_dims)
        }))
    }
}

fn subsample(x: &candle_core::Tensor, axis: usize, stride: usize) -> Result<candle_core::Tensor, Error> {
    if stride == 1 {
        return Ok(x.clone());
    }
    let count = x.dim(axis)?.div_ceil(stride);
    let ids = candle_core::Tensor::arange_step(0u32, (count * stride) as u32, stride as u32, x.device())?;
    Ok(x.index_select(&ids, axis)?)
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        let as_i64 = |v: &[usize]| v.iter().map(|x| *x as i64).collect::<Vec<_>>();
        vec![
            attributes::ints("kernel_shape", &as_i64(&self.kernel_shape)),
            attributes::ints("strides", &as_i64(&self.strides)),
            attributes::ints("pads", &as_i64(&self.pads)),
            attributes::ints("dilations", &[1, 1]),
            attributes::int("group", 1),
        ]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let [top, left, bottom, right] = self.pads;
        let mut x = inputs[0].clone();
        if top > 0 || bottom > 0 {
            x = x.pad_with_zeros(2, top, bottom)?;
        }
        if left > 0 || right > 0 {
            x = x.pad_with_zeros(3, left, right)?;
        }
        // Dense stride-1 convolution, then keep every stride-th row/column.
        let out = x.contiguous()?.conv2d(&inputs[1].contiguous()?, 0, 1, 1, 1)?;
        let out = subsample(&out, 2, self.strides[0])?;
        let mut out = subsample(&out, 3, self.strides[1])?;
        if inputs.len() > 2 {
            let channels = inputs[2].elem_count();
            out = out.broadcast_add(&inputs[2].reshape((1, channels, 1, 1))?)?;
        }
        Ok(vec![out])
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Inference-mode batch normalization over axis 1 using running statistics.
pub struct BatchNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Arc<dyn Tensor>,
    mean: Arc<dyn Tensor>,
    var: Arc<dyn Tensor>,
    epsilon: f32,
    momentum: f32
}

impl BatchNormalization {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Arc<dyn Tensor>, mean: Arc<dyn Tensor>, var: Arc<dyn Tensor>, epsilon: f32, momentum: f32) -> Result<Arc<Self>, Error> {
        if input.rank() < 2 {
            return Err(Error::InputShapeError(format!("batch norm of {}", input.shape())));
        }
        for param in [&scale, &bias, &mean, &var] {
            if param.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), param.dtype()));
            }
            if param.rank() != 1 || param.shape()[0].as_ref() != input.shape()[1].as_ref() {
                return Err(Error::InputShapeError(format!("batch norm parameter {} for input {}", param.shape(), input.shape())));
            }
        }
        Ok(Arc::new(Self { name, input, scale, bias, mean, var, epsilon, momentum }))
    }
}

impl Node for BatchNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.scale.as_ref(), self.bias.as_ref(), self.mean.as_ref(), self.var.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "BatchNormalization"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attributes::float("epsilon", self.epsilon), attributes::float("momentum", self.momentum)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let x = &inputs[0];
        let mut param_shape = vec![1usize; x.rank()];
        param_shape[1] = x.dim(1)?;
        let scale = inputs[1].reshape(param_shape.clone())?;
        let bias = inputs[2].reshape(param_shape.clone())?;
        let mean = inputs[3].reshape(param_shape.clone())?;
        let std = inputs[4].affine(1.0, self.epsilon as f64)?.sqrt()?.reshape(param_shape)?;
        let out = x.broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .broadcast_mul(&scale)?
            .broadcast_add(&bias)?;
        Ok(vec![out])
    }
}

impl SingleOutputNode for BatchNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct ShapeOf {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    output_shape: Shape
}

impl ShapeOf {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        let output_shape = Shape::new(vec![Dimension::fixed(input.rank())]);
        Arc::new(Self { name, input, output_shape })
    }
}

impl Node for ShapeOf {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Shape"
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let dims: Vec<i64> = inputs[0].dims().iter().map(|x| *x as i64).collect();
        Ok(vec![candle_core::Tensor::new(dims.as_slice(), &Device::Cpu)?])
    }
}

impl SingleOutputNode for ShapeOf {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        DType::I64
    }
}

/// `[start, limit)` in steps of `delta`; `length` is the symbolic element count.
pub struct Range {
    name: Option<String>,
    start: Arc<dyn Tensor>,
    limit: Arc<dyn Tensor>,
    delta: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Range {
    pub fn new(name: Option<String>, start: Arc<dyn Tensor>, limit: Arc<dyn Tensor>, delta: Arc<dyn Tensor>, length: Arc<Dimension>) -> Result<Arc<Self>, Error> {
        for t in [&start, &limit, &delta] {
            if t.rank() != 0 {
                return Err(Error::InputShapeError(format!("range bound of shape {}", t.shape())));
            }
            if t.dtype() != start.dtype() {
                return Err(Error::DTypeMismatchError(start.dtype(), t.dtype()));
            }
        }
        if start.dtype() != DType::I64 {
            return Err(Error::InvalidDTypeError(start.dtype().to_string()));
        }
        Ok(Arc::new(Self { name, start, limit, delta, output_shape: Shape::new(vec![length]) }))
    }
}

impl Node for Range {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.start.as_ref(), self.limit.as_ref(), self.delta.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Range"
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        let start = inputs[0].to_scalar::<i64>()?;
        let limit = inputs[1].to_scalar::<i64>()?;
        let delta = inputs[2].to_scalar::<i64>()?;
        Ok(vec![candle_core::Tensor::arange_step(start, limit, delta, &Device::Cpu)?])
    }
}

impl SingleOutputNode for Range {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        DType::I64
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        // Constant data always has a fixed shape, so this cannot fail.
        match self.data.to_tensor_data_proto(None) {
            Ok(tensor) => vec![attributes::tensor("value", tensor)],
            Err(_) => vec![]
        }
    }

    fn evaluate(&self, _inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        Ok(vec![self.data.to_candle_tensor()?])
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attributes::int("to", onnx::tensor_proto::DataType::from(self.to) as i64)]
    }

    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error> {
        Ok(vec![inputs[0].to_dtype(self.to.to_candle()?)?])
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::InputTensor;

    fn input(name: &str, dims: Vec<Arc<Dimension>>) -> Arc<dyn Tensor> {
        InputTensor::new(name.to_string(), DType::F32, Shape::new(dims))
    }

    #[test]
    fn broadcast_keeps_dynamic_dimension() {
        let time = Dimension::dynamic("time");
        let a = input("a", vec![Dimension::fixed(1), time.clone(), Dimension::fixed(8)]);
        let b = input("b", vec![Dimension::fixed(8)]);
        let sum = add(a, b).unwrap();
        assert_eq!(sum.shape().rank(), 3);
        assert!(Arc::ptr_eq(&sum.shape()[1], &time));
        assert_eq!(sum.shape()[2].value, Some(8));
    }

    #[test]
    fn broadcast_rejects_mismatched_extents() {
        let a = input("a", vec![Dimension::fixed(3), Dimension::fixed(4)]);
        let b = input("b", vec![Dimension::fixed(5)]);
        assert!(matches!(add(a, b), Err(Error::InputShapeError(_))));
    }

    #[test]
    fn matmul_checks_inner_dimension() {
        let a = input("a", vec![Dimension::fixed(2), Dimension::fixed(3)]);
        let b = input("b", vec![Dimension::fixed(4), Dimension::fixed(5)]);
        assert!(MatMul::new(None, a, b).is_err());
    }

    #[test]
    fn conv_preserves_dynamic_time_axis() {
        let time = Dimension::dynamic("time");
        let x = input("x", vec![Dimension::fixed(1), Dimension::fixed(1), Dimension::fixed(128), time.clone()]);
        let w = input("w", vec![Dimension::fixed(32), Dimension::fixed(1), Dimension::fixed(4), Dimension::fixed(3)]);
        let conv = Conv::new(None, x, w, None, [4, 1], [0, 1, 0, 1]).unwrap();
        assert_eq!(conv.shape()[1].value, Some(32));
        assert_eq!(conv.shape()[2].value, Some(32));
        assert!(Arc::ptr_eq(&conv.shape()[3], &time));
    }

    #[test]
    fn conv_evaluation_matches_direct_computation() {
        let device = Device::Cpu;
        // 1x1x4x2 input, 1x1x2x3 kernel, stride (2, 1), time padding 1.
        let x = candle_core::Tensor::new(&[[[[1f32, 2.], [3., 4.], [5., 6.], [7., 8.]]]], &device).unwrap();
        let w = candle_core::Tensor::new(&[[[[1f32, 0., -1.], [0., 1., 0.]]]], &device).unwrap();
        let xi = input("x", vec![Dimension::fixed(1), Dimension::fixed(1), Dimension::fixed(4), Dimension::fixed(2)]);
        let wi = input("w", vec![Dimension::fixed(1), Dimension::fixed(1), Dimension::fixed(2), Dimension::fixed(3)]);
        let conv = Conv::new(None, xi, wi, None, [2, 1], [0, 1, 0, 1]).unwrap();
        let out = conv.evaluate(&[x, w]).unwrap().remove(0);
        assert_eq!(out.dims(), &[1, 1, 2, 2]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0: pad(1,2) -> [0,1,2,0]; row 1: pad(3,4) -> [0,3,4,0]
        // out[0][0] = 0*1 + 1*0 + 2*-1 + 3 (center of row 1) = 1
        // out[0][1] = 1*1 + 2*0 + 0*-1 + 4 = 5
        // Rows 2/3 analogously: 0+0-6+7 = 1 and 5+0+0+8 = 13
        assert_eq!(values, vec![1., 5., 1., 13.]);
    }

    #[test]
    fn reshape_target_resolution() {
        assert_eq!(resolve_reshape_target(&[2, 3, 4], &[-1, 4]).unwrap(), vec![6, 4]);
        assert_eq!(resolve_reshape_target(&[2, 3, 4], &[0, -1]).unwrap(), vec![2, 12]);
        assert!(resolve_reshape_target(&[2, 3, 4], &[5, -1]).is_err());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = input("x", vec![Dimension::fixed(2), Dimension::fixed(3)]);
        let softmax = Softmax::new(None, x, -1).unwrap();
        let value = candle_core::Tensor::new(&[[1f32, 2., 3.], [-1., 0., 10.]], &Device::Cpu).unwrap();
        let out = softmax.evaluate(&[value]).unwrap().remove(0);
        let sums: Vec<f32> = out.sum(1).unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
    }
}
