#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread::JoinHandle;
use candle_core::{DType, Device, Tensor};
use beat_this_export::checkpoint::StateDict;
use beat_this_export::model::{BeatThis, BeatThisConfig};

pub fn small_config() -> BeatThisConfig {
    BeatThisConfig {
        spect_dim: 128,
        transformer_dim: 32,
        ff_mult: 2,
        n_layers: 2,
        head_dim: 8,
        stem_dim: 8,
        sum_head: true,
        partial_transformers: true,
    }
}

/// Values for every schema entry, with unit running variances.
pub fn random_state_dict(model: &BeatThis) -> StateDict {
    let mut state = StateDict::new();
    for param in model.expected_parameters() {
        let tensor = if param.dtype == DType::I64 {
            Tensor::zeros(param.shape.as_slice(), DType::I64, &Device::Cpu).unwrap()
        } else if param.name.ends_with("running_var") {
            Tensor::ones(param.shape.as_slice(), DType::F32, &Device::Cpu).unwrap()
        } else {
            Tensor::randn(0f32, 0.1, param.shape.as_slice(), &Device::Cpu).unwrap()
        };
        state.insert(param.name.clone(), tensor);
    }
    state
}

/// Minimal protocol 2 pickle writer, enough for a `torch.save` checkpoint.
#[derive(Default)]
struct Pickler {
    out: Vec<u8>,
}

impl Pickler {
    fn op(&mut self, op: u8) {
        self.out.push(op);
    }

    fn global(&mut self, module: &str, name: &str) {
        self.op(b'c');
        self.out.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
    }

    fn string(&mut self, value: &str) {
        self.op(b'X');
        self.out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.out.extend_from_slice(value.as_bytes());
    }

    fn int(&mut self, value: i32) {
        self.op(b'J');
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn float(&mut self, value: f64) {
        self.op(b'G');
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn bool(&mut self, value: bool) {
        self.op(if value { 0x88 } else { 0x89 });
    }

    fn int_tuple(&mut self, values: &[usize]) {
        self.op(b'(');
        for &value in values {
            self.int(value as i32);
        }
        self.op(b't');
    }

    fn ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.op(b')');
        self.op(b'R');
    }

    fn tensor(&mut self, storage_key: &str, tensor: &Tensor) {
        let storage_class = match tensor.dtype() {
            DType::I64 => "LongStorage",
            _ => "FloatStorage",
        };
        let dims = tensor.dims();
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        self.global("torch._utils", "_rebuild_tensor_v2");
        self.op(b'(');
        self.op(b'(');
        self.string("storage");
        self.global("torch", storage_class);
        self.string(storage_key);
        self.string("cpu");
        self.int(tensor.elem_count() as i32);
        self.op(b't');
        self.op(b'Q');
        self.int(0);
        self.int_tuple(dims);
        self.int_tuple(&strides);
        self.bool(false);
        self.ordered_dict();
        self.op(b't');
        self.op(b'R');
    }
}

fn tensor_bytes(tensor: &Tensor) -> Vec<u8> {
    let flat = tensor.flatten_all().unwrap();
    match tensor.dtype() {
        DType::I64 => flat.to_vec1::<i64>().unwrap().iter().flat_map(|x| x.to_le_bytes()).collect(),
        _ => flat.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap().iter().flat_map(|x| x.to_le_bytes()).collect(),
    }
}

/// Writes `state_dict` the way a Lightning checkpoint stores it, next to
/// some training metadata.
pub fn write_checkpoint(path: &Path, state_dict: &StateDict) {
    let mut pickler = Pickler::default();
    let mut storages = vec![];

    pickler.op(0x80);
    pickler.op(2);
    pickler.op(b'}');
    pickler.op(b'(');

    pickler.string("epoch");
    pickler.int(3);

    pickler.string("state_dict");
    pickler.ordered_dict();
    pickler.op(b'(');
    for (name, tensor) in state_dict {
        let key = storages.len().to_string();
        pickler.string(name);
        pickler.tensor(&key, tensor);
        storages.push((key, tensor_bytes(tensor)));
    }
    pickler.op(b'u');

    pickler.string("hyper_parameters");
    pickler.op(b'}');
    pickler.op(b'(');
    pickler.string("lr");
    pickler.float(0.0008);
    pickler.string("sum_head");
    pickler.bool(true);
    pickler.op(b'u');

    pickler.op(b'u');
    pickler.op(b'.');

    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("archive/data.pkl", options).unwrap();
    zip.write_all(&pickler.out).unwrap();
    for (key, bytes) in storages {
        zip.start_file(format!("archive/data/{key}"), options).unwrap();
        zip.write_all(&bytes).unwrap();
    }
    zip.start_file("archive/version", options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();
}

/// Prefixes every key the way the training wrapper does.
pub fn wrapped(state_dict: &StateDict) -> StateDict {
    state_dict.iter().map(|(k, v)| (format!("model.{k}"), v.clone())).collect()
}

/// Serves `body` to exactly one HTTP request; returns the URL and the server thread.
pub fn serve_once(body: Vec<u8>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/final0.ckpt", listener.local_addr().unwrap());
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 0 {
            if line == "\r\n" {
                break;
            }
            line.clear();
        }
        let mut stream = stream;
        write!(stream, "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len()).unwrap();
        stream.write_all(&body).unwrap();
        stream.flush().unwrap();
    });
    (url, handle)
}

/// A local URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{address}/final0.ckpt")
}
