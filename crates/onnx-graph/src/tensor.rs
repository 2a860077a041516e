use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use core::fmt;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn fixed(value: usize) -> Arc<Self> {
        Self::new(Some(value), None, None)
    }

    /// A dimension whose extent is only known at inference time.
    pub fn dynamic(name: &str) -> Arc<Self> {
        Self::new(None, Some(name.to_string()), None)
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or_else(|| Error::UnresolvedDimensionError(self.to_string()))
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64)),
                None => value.name.as_ref().map(|name| onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone()))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || match (self.value, other.value) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.name.is_some() && self.name == other.name,
            _ => false
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        }
        else if let Some(name) = &self.name {
            write!(f, "{}", name)
        }
        else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        let mut res = vec![];
        for dim in &self.dims {
            res.push(dim.resolve()?);
        }
        Ok(res)
    }

    pub fn permute(&self, perm: &[usize]) -> Result<Self, Error> {
        if perm.len() != self.rank() {
            return Err(Error::InvalidInputError(format!("permutation {perm:?} for rank {}", self.rank())));
        }
        let mut seen = vec![false; perm.len()];
        let mut dims = vec![];
        for &p in perm {
            if p >= perm.len() || seen[p] {
                return Err(Error::InvalidInputError(format!("invalid permutation {perm:?}")));
            }
            seen[p] = true;
            dims.push(self.dims[p].clone());
        }
        Ok(Self::new(dims))
    }

    pub fn normalize_axis(&self, axis: i64) -> Result<usize, Error> {
        normalize_axis(axis, self.rank())
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        let rank = self.rank();
        let index = if index < 0 {
            rank - (-index) as usize
        }
        else {
            index as usize
        };
        &self.dims[index]
    }

    pub fn unsqueeze(&self, axis: isize) -> Self {
        let rank = self.rank() + 1;
        let axis = if axis < 0 {
            rank - (-axis) as usize
        }
        else {
            axis as usize
        };
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::fixed(1));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(a: &Shape, b: &Shape) -> Result<Shape, Error> {
        let rank = a.rank().max(b.rank());
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = (i + a.rank()).checked_sub(rank).map(|j| &a.dims[j]);
            let db = (i + b.rank()).checked_sub(rank).map(|j| &b.dims[j]);
            let dim = match (da, db) {
                (Some(da), None) => da.clone(),
                (None, Some(db)) => db.clone(),
                (Some(da), Some(db)) => {
                    if da.as_ref() == db.as_ref() {
                        da.clone()
                    } else if da.value == Some(1) {
                        db.clone()
                    } else if db.value == Some(1) {
                        da.clone()
                    } else {
                        return Err(Error::InputShapeError(format!("cannot broadcast {a} with {b}")));
                    }
                }
                (None, None) => unreachable!(),
            };
            dims.push(dim);
        }
        Ok(Shape::new(dims))
    }
}

pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize, Error> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(Error::InvalidInputError(format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(resolved as usize)
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", "))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::fixed(*x)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64
}

impl DType {
    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            other => Err(Error::UnsupportedDTypeError(format!("{other:?}")))
        }
    }

    pub fn to_candle(self) -> Result<candle_core::DType, Error> {
        match self {
            DType::F32 => Ok(candle_core::DType::F32),
            DType::F16 => Ok(candle_core::DType::F16),
            DType::BF16 => Ok(candle_core::DType::BF16),
            DType::I64 => Ok(candle_core::DType::I64),
            DType::I32 => Err(Error::UnsupportedDTypeError("I32".to_string()))
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// Collects the nodes this tensor depends on, producers before consumers.
    fn get_nodes<'a>(&'a self, _table: &mut NodeTable<'a>) {}

    /// The node computing this tensor, if any.
    fn get_producer(&self) -> Option<&dyn Node> {
        None
    }

    fn get_initializer(&self, _name: String) -> Result<Option<TensorProto>, Error> {
        Ok(None)
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    /// Value held by the graph itself (weights), as opposed to computed or fed values.
    fn resolve_value(&self) -> Option<candle_core::Tensor> {
        None
    }

    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

/// Nodes of a graph in dependency order.
#[derive(Default)]
pub struct NodeTable<'a> {
    seen: HashSet<&'a dyn Node>,
    pub(crate) order: Vec<&'a dyn Node>
}

impl<'a> NodeTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, node: &'a dyn Node) -> bool {
        self.seen.contains(&node)
    }

    pub(crate) fn push(&mut self, node: &'a dyn Node) {
        if self.seen.insert(node) {
            self.order.push(node);
        }
    }

    pub fn nodes(&self) -> &[&'a dyn Node] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn get_nodes<'a>(&'a self, table: &mut NodeTable<'a>) {
        <Self as Node>::get_nodes(self, table)
    }

    fn get_producer(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// A learned parameter embedded in the graph as an initializer.
pub struct WeightTensor {
    name: String,
    data: candle_core::Tensor,
    data_type: DType,
    shape: Shape
}

impl WeightTensor {
    pub fn new(name: String, data: candle_core::Tensor) -> Result<Arc<Self>, Error> {
        let data_type = DType::from_candle(data.dtype())?;
        let shape = Shape::from(data.shape());
        Ok(Arc::new(Self { name, data, data_type, shape }))
    }
}

impl Tensor for WeightTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_initializer(&self, name: String) -> Result<Option<TensorProto>, Error> {
        let data = TensorData::from_candle_tensor(self.data.clone())?;
        Ok(Some(data.to_tensor_data_proto(Some(name))?))
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn resolve_value(&self) -> Option<candle_core::Tensor> {
        Some(self.data.clone())
    }

    fn is_input(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError(format!("{} values for shape {}", value.len(), shape)));
        }
        Ok(Self { value, shape })
    }

    pub fn scalar<T>(value: T) -> Self
    where
        TensorDataValue: From<Vec<T>>,
    {
        Self { value: TensorDataValue::from(vec![value]), shape: Shape::new(vec![]) }
    }

    pub fn vector<T>(values: Vec<T>) -> Self
    where
        TensorDataValue: From<Vec<T>>,
    {
        let shape = Shape::new(vec![Dimension::fixed(values.len())]);
        Self { value: TensorDataValue::from(values), shape }
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            other => Err(Error::UnsupportedDTypeError(other.dtype().to_string())),
        }
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub fn to_candle_tensor(&self) -> Result<candle_core::Tensor, Error> {
        let shape = self.shape.resolve()?;
        let device = candle_core::Device::Cpu;
        Ok(match &self.value {
            TensorDataValue::F32(v) => candle_core::Tensor::from_vec(v.clone(), shape, &device)?,
            TensorDataValue::F16(v) => candle_core::Tensor::from_vec(v.clone(), shape, &device)?,
            TensorDataValue::BF16(v) => candle_core::Tensor::from_vec(v.clone(), shape, &device)?,
            TensorDataValue::I64(v) => candle_core::Tensor::from_vec(v.clone(), shape, &device)?,
            TensorDataValue::I32(v) => candle_core::Tensor::from_vec(v.iter().map(|x| *x as i64).collect::<Vec<_>>(), shape, &device)?,
        })
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            other => return Err(Error::UnsupportedDTypeError(format!("{other:?}"))),
        };
        Ok(Self{
            shape,
            value
        })
    }
}
