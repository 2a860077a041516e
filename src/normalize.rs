//! Undo the namespacing the training wrapper applies to the model's parameters.
//!
//! The wrapper holds the network as its `model` attribute, so every parameter
//! name in a saved checkpoint carries a `model.` prefix that the bare network
//! does not expect.

use std::collections::btree_map::Entry;
use std::collections::HashMap;
use crate::Error;
use crate::checkpoint::StateDict;

pub const WRAPPER_PREFIX: &str = "model.";

/// Removes exactly one leading [`WRAPPER_PREFIX`]; other keys pass through.
pub fn strip_wrapper_prefix(key: &str) -> &str {
    key.strip_prefix(WRAPPER_PREFIX).unwrap_or(key)
}

/// Builds a new state dict with [`strip_wrapper_prefix`] applied to every key.
///
/// Tensors are shared with the input, which is left untouched. Two source keys
/// collapsing onto the same name is an error rather than a silent overwrite.
pub fn normalize_state_dict(state_dict: &StateDict) -> Result<StateDict, Error> {
    let mut normalized = StateDict::new();
    let mut sources: HashMap<&str, &str> = HashMap::new();
    for (key, tensor) in state_dict {
        let new_key = strip_wrapper_prefix(key);
        match normalized.entry(new_key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(tensor.clone());
                sources.insert(new_key, key);
            }
            Entry::Occupied(_) => {
                return Err(Error::KeyCollision {
                    first: sources.get(new_key).copied().unwrap_or(new_key).to_string(),
                    second: key.clone(),
                    normalized: new_key.to_string(),
                });
            }
        }
    }
    log::debug!(
        "normalized {} keys ({} carried the {WRAPPER_PREFIX:?} prefix)",
        normalized.len(),
        state_dict.keys().filter(|k| k.starts_with(WRAPPER_PREFIX)).count()
    );
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn tensor(value: f32) -> Tensor {
        Tensor::new(&[value], &Device::Cpu).unwrap()
    }

    #[test]
    fn strips_exactly_one_prefix() {
        assert_eq!(strip_wrapper_prefix("model.frontend.linear.weight"), "frontend.linear.weight");
        assert_eq!(strip_wrapper_prefix("model.model.x"), "model.x");
        assert_eq!(strip_wrapper_prefix("frontend.linear.weight"), "frontend.linear.weight");
        assert_eq!(strip_wrapper_prefix("models.x"), "models.x");
        assert_eq!(strip_wrapper_prefix("model"), "model");
        assert_eq!(strip_wrapper_prefix("model."), "");
    }

    #[test]
    fn prefixed_keys_map_one_to_one() {
        let mut state = StateDict::new();
        state.insert("model.a.weight".to_string(), tensor(1.0));
        state.insert("model.b.bias".to_string(), tensor(2.0));
        let normalized = normalize_state_dict(&state).unwrap();
        assert_eq!(normalized.len(), state.len());
        assert_eq!(normalized.keys().collect::<Vec<_>>(), vec!["a.weight", "b.bias"]);
        let value: Vec<f32> = normalized["b.bias"].to_vec1().unwrap();
        assert_eq!(value, vec![2.0]);
        // Input untouched.
        assert!(state.contains_key("model.a.weight"));
    }

    #[test]
    fn unprefixed_keys_are_identity() {
        let mut state = StateDict::new();
        state.insert("a.weight".to_string(), tensor(1.0));
        state.insert("model.b".to_string(), tensor(2.0));
        let normalized = normalize_state_dict(&state).unwrap();
        assert!(normalized.contains_key("a.weight"));
        assert!(normalized.contains_key("b"));
    }

    #[test]
    fn colliding_keys_are_rejected() {
        let mut state = StateDict::new();
        state.insert("model.x".to_string(), tensor(1.0));
        state.insert("x".to_string(), tensor(2.0));
        match normalize_state_dict(&state) {
            Err(Error::KeyCollision { normalized, .. }) => assert_eq!(normalized, "x"),
            other => panic!("expected a key collision, got {other:?}"),
        }
    }
}
