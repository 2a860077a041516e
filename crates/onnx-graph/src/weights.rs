use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use crate::Error;
use crate::tensor::{Tensor, WeightTensor};

/// Dotted-prefix scoped access to a model's named parameters.
pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_prefix_tail(&self) -> Option<&str>;
    fn get_prefix(&self) -> Option<&str>;
    fn get_tensor_names(&self) -> Vec<String>;

    fn has_tensor(&self, name: &str) -> bool {
        self.get_tensor(name).is_ok()
    }
}

struct TensorMapInner {
    tensors: Arc<BTreeMap<String, candle_core::Tensor>>,
    // One graph tensor per parameter, so a weight read twice is embedded once.
    issued: Mutex<HashMap<String, Arc<WeightTensor>>>
}

pub struct TensorMapWeightManager {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    inner: Arc<TensorMapInner>
}

impl TensorMapWeightManager {
    pub fn new(tensors: Arc<BTreeMap<String, candle_core::Tensor>>) -> Self {
        Self {
            prefix_tail: None,
            prefix: None,
            inner: Arc::new(TensorMapInner {
                tensors,
                issued: Mutex::new(HashMap::new())
            })
        }
    }

    fn full_name(&self, name: &str) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}.{}", prefix, name)
        } else {
            name.to_string()
        }
    }
}

impl WeightManager for TensorMapWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(self.full_name(name)),
            inner: self.inner.clone()
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let name = self.full_name(name);
        let mut issued = self.inner.issued.lock().map_err(|_| Error::PoisonedWeightCache)?;
        if let Some(tensor) = issued.get(&name) {
            return Ok(tensor.clone());
        }
        let data = self.inner.tensors.get(&name).ok_or_else(|| Error::NoSuchTensorError(name.clone()))?;
        let tensor = WeightTensor::new(name.clone(), data.clone())?;
        issued.insert(name, tensor.clone());
        Ok(tensor)
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        self.inner.tensors.keys().cloned().collect()
    }

    fn has_tensor(&self, name: &str) -> bool {
        self.inner.tensors.contains_key(&self.full_name(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor as CandleTensor};

    fn manager() -> TensorMapWeightManager {
        let mut map = BTreeMap::new();
        map.insert("encoder.proj.weight".to_string(), CandleTensor::zeros((4, 2), candle_core::DType::F32, &Device::Cpu).unwrap());
        map.insert("encoder.proj.bias".to_string(), CandleTensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap());
        TensorMapWeightManager::new(Arc::new(map))
    }

    #[test]
    fn prefixes_compose_with_dots() {
        let wm = manager().prefix("encoder").prefix("proj");
        assert_eq!(wm.get_prefix(), Some("encoder.proj"));
        assert_eq!(wm.get_prefix_tail(), Some("proj"));
        let weight = wm.get_tensor("weight").unwrap();
        assert_eq!(weight.get_name(), Some("encoder.proj.weight"));
        assert_eq!(weight.shape().resolve().unwrap(), vec![4, 2]);
        assert!(wm.has_tensor("bias"));
        assert!(!wm.has_tensor("scale"));
    }

    #[test]
    fn repeated_lookup_yields_same_graph_tensor() {
        let wm = manager().prefix("encoder.proj");
        let a = wm.get_tensor("weight").unwrap();
        let b = wm.get_tensor("weight").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_weight_is_reported_by_full_name() {
        let wm = manager().prefix("decoder");
        match wm.get_tensor("weight") {
            Err(Error::NoSuchTensorError(name)) => assert_eq!(name, "decoder.weight"),
            _ => panic!("expected NoSuchTensorError")
        }
    }
}
