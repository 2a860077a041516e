//! Reading training checkpoints saved with `torch.save` (zip archive format).

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use candle_core::pickle::{Object, Stack};
use crate::Error;

/// Parameter name to CPU tensor.
pub type StateDict = BTreeMap<String, candle_core::Tensor>;

const STATE_DICT_KEY: &str = "state_dict";
const HYPER_PARAMETERS_KEY: &str = "hyper_parameters";

pub struct Checkpoint {
    pub path: PathBuf,
    pub top_level_keys: Vec<String>,
    pub hyper_parameters: Option<String>,
    pub state_dict: StateDict,
}

fn load_error(path: &Path, err: impl Display) -> Error {
    Error::CheckpointLoad {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn read_root_object(path: &Path) -> Result<Object, Error> {
    let file = File::open(path).map_err(|e| load_error(path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| load_error(path, e))?;
    let pickle_name = archive.file_names()
        .find(|x| x.ends_with("data.pkl"))
        .map(|x| x.to_string())
        .ok_or_else(|| load_error(path, "archive has no data.pkl"))?;
    let entry = archive.by_name(&pickle_name).map_err(|e| load_error(path, e))?;
    let mut reader = BufReader::new(entry);
    let mut stack = Stack::empty();
    stack.read_loop(&mut reader).map_err(|e| load_error(path, e))?;
    stack.finalize().map_err(|e| load_error(path, e))
}

fn is_key(object: &Object, key: &str) -> bool {
    matches!(object, Object::Unicode(x) if x == key)
}

impl Checkpoint {
    /// Reads the container metadata and every tensor of its `state_dict`
    /// entry into memory on the CPU.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let entries = match read_root_object(path)? {
            Object::Dict(entries) => entries,
            other => return Err(load_error(path, format!("expected a mapping at the top level, found {}", render(&other)))),
        };
        if !entries.iter().any(|(k, _)| is_key(k, STATE_DICT_KEY)) {
            return Err(load_error(path, format!("no {STATE_DICT_KEY:?} entry")));
        }
        let top_level_keys = entries.iter().map(|(k, _)| match k {
            Object::Unicode(key) => key.clone(),
            other => render(other)
        }).collect();
        let hyper_parameters = entries.iter()
            .find(|(k, _)| is_key(k, HYPER_PARAMETERS_KEY))
            .map(|(_, v)| render(v));

        let tensors = candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY))
            .map_err(|e| load_error(path, e))?;
        let state_dict: StateDict = tensors.into_iter().collect();
        log::debug!("read {} tensors from {}", state_dict.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            top_level_keys,
            hyper_parameters,
            state_dict,
        })
    }
}

fn render_sequence(items: &[Object]) -> String {
    items.iter().map(render).collect::<Vec<_>>().join(", ")
}

/// Python-style rendering of an unpickled value.
pub fn render(object: &Object) -> String {
    match object {
        Object::Unicode(x) => format!("'{}'", x.replace('\\', "\\\\").replace('\'', "\\'")),
        Object::Int(x) => x.to_string(),
        Object::Long(x) => x.to_string(),
        Object::Float(x) => format!("{x:?}"),
        Object::Bool(true) => "True".to_string(),
        Object::Bool(false) => "False".to_string(),
        Object::None => "None".to_string(),
        Object::Tuple(items) if items.len() == 1 => format!("({},)", render(&items[0])),
        Object::Tuple(items) => format!("({})", render_sequence(items)),
        Object::List(items) => format!("[{}]", render_sequence(items)),
        Object::Dict(entries) => {
            let entries = entries.iter()
                .map(|(k, v)| format!("{}: {}", render(k), render(v)))
                .collect::<Vec<_>>();
            format!("{{{}}}", entries.join(", "))
        }
        Object::Class { module_name, class_name } => format!("{module_name}.{class_name}"),
        Object::Reduce { callable, args } => match args.as_ref() {
            Object::Tuple(items) => format!("{}({})", render(callable), render_sequence(items)),
            other => format!("{}({})", render(callable), render(other)),
        },
        // Objects restored from their attribute dict, e.g. AttributeDict.
        Object::Build { args, .. } if matches!(args.as_ref(), Object::Dict(_)) => render(args),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_python_literals() {
        let object = Object::Dict(vec![
            (Object::Unicode("lr".to_string()), Object::Float(0.0008)),
            (Object::Unicode("sum_head".to_string()), Object::Bool(true)),
            (Object::Unicode("fps".to_string()), Object::Int(50)),
            (Object::Unicode("tags".to_string()), Object::Tuple(vec![Object::Unicode("a'b".to_string())])),
            (Object::Unicode("none".to_string()), Object::None),
        ]);
        assert_eq!(render(&object), "{'lr': 0.0008, 'sum_head': True, 'fps': 50, 'tags': ('a\\'b',), 'none': None}");
        assert_eq!(render(&Object::Float(1.0)), "1.0");
        assert_eq!(render(&Object::List(vec![Object::Long(3), Object::Int(-1)])), "[3, -1]");
    }

    #[test]
    fn attribute_dicts_render_as_their_contents() {
        let object = Object::Build {
            callable: Box::new(Object::Reduce {
                callable: Box::new(Object::Class { module_name: "lightning".to_string(), class_name: "AttributeDict".to_string() }),
                args: Box::new(Object::Tuple(vec![])),
            }),
            args: Box::new(Object::Dict(vec![(Object::Unicode("x".to_string()), Object::Int(1))])),
        };
        assert_eq!(render(&object), "{'x': 1}");
    }

    #[test]
    fn non_archive_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ckpt");
        std::fs::write(&path, b"not a zip archive").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(Error::CheckpointLoad { .. })));
        assert!(matches!(Checkpoint::load(dir.path().join("missing.ckpt")), Err(Error::CheckpointLoad { .. })));
    }
}
