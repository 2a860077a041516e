use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::default::Default;
use crate::tensor::{NodeTable, Shape, TensorData};
use crate::tensor::Tensor;
use crate::{DType, Error};

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_nodes<'a>(&'a self, table: &mut NodeTable<'a>) where Self: Sized {
        let dyn_self: &dyn Node = self;
        if !table.contains(dyn_self) {
            self.get_sub_nodes(table);
            table.push(dyn_self);
        }
    }

    fn get_sub_nodes<'a>(&'a self, table: &mut NodeTable<'a>) {
        for input in self.get_input_tensors() {
            input.get_nodes(table);
        }
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;
    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Vec<crate::onnx::AttributeProto> {
        vec![]
    }

    /// Computes the node's outputs from concrete input values, in input order.
    fn evaluate(&self, inputs: &[candle_core::Tensor]) -> Result<Vec<candle_core::Tensor>, Error>;

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<&dyn Tensor, String>) -> crate::onnx::NodeProto {
        crate::onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: self.get_input_tensors().iter().map(|tensor| tensor_names[tensor].clone()).collect(),
            output: self.get_output_tensors().iter().map(|tensor| tensor_names[tensor].clone()).collect(),
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes(),
            .. Default::default()
        }
    }
}

impl<'a> PartialEq for &'a dyn Node{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Node{}

impl<'a> Hash for &'a dyn Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

pub trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;

    fn resolve_output_data(&self) -> Option<TensorData> {
        None
    }
}

pub(crate) mod attributes {
    use crate::onnx::{self, attribute_proto::AttributeType, AttributeProto, TensorProto};

    pub fn int(name: &str, value: i64) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Int as i32,
            i: value,
            .. Default::default()
        }
    }

    pub fn ints(name: &str, values: &[i64]) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Ints as i32,
            ints: values.to_vec(),
            .. Default::default()
        }
    }

    pub fn float(name: &str, value: f32) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Float as i32,
            f: value,
            .. Default::default()
        }
    }

    pub fn tensor(name: &str, value: TensorProto) -> AttributeProto {
        onnx::AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Tensor as i32,
            t: Some(value),
            .. Default::default()
        }
    }
}
