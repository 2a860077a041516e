//! The Beat This! beat/downbeat tracker, built as an onnx-graph graph from a
//! bound state dict.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use onnx_graph::operators::{self, Concat, MatMul, Softmax, Unary, WhichUnaryOperation};
use onnx_graph::pytorch::{batch_norm, constant_f32, conv2d, gelu, linear, positions, reshape, rms_norm, select, transpose, unsqueeze};
use onnx_graph::weights::{TensorMapWeightManager, WeightManager};
use onnx_graph::{DType, Dimension, InputTensor, Shape, Tensor};
use crate::Error;
use crate::checkpoint::StateDict;
use crate::error::StateDictMismatch;

pub const INPUT_NAME: &str = "input_spectrogram";
pub const BEAT_OUTPUT: &str = "beat";
pub const DOWNBEAT_OUTPUT: &str = "downbeat";

const BATCH_NORM_EPSILON: f32 = 1e-5;
// Frequency reduction of the stem (4) and the three frontend blocks (2 each).
const FREQUENCY_REDUCTION: usize = 32;
const FRONTEND_BLOCKS: usize = 3;
const PARTIAL_FF_MULT: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct BeatThisConfig {
    pub spect_dim: usize,
    pub transformer_dim: usize,
    pub ff_mult: usize,
    pub n_layers: usize,
    pub head_dim: usize,
    pub stem_dim: usize,
    pub sum_head: bool,
    pub partial_transformers: bool,
}

impl Default for BeatThisConfig {
    fn default() -> Self {
        Self {
            spect_dim: 128,
            transformer_dim: 512,
            ff_mult: 4,
            n_layers: 6,
            head_dim: 32,
            stem_dim: 32,
            sum_head: true,
            partial_transformers: true,
        }
    }
}

impl BeatThisConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.spect_dim == 0 || self.spect_dim % FREQUENCY_REDUCTION != 0 {
            return invalid(format!("spect_dim {} is not a positive multiple of {FREQUENCY_REDUCTION}", self.spect_dim));
        }
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            return invalid(format!("head_dim {} must be even and positive", self.head_dim));
        }
        if self.transformer_dim % self.head_dim != 0 {
            return invalid(format!("transformer_dim {} is not divisible by head_dim {}", self.transformer_dim, self.head_dim));
        }
        for dim in self.frontend_dims() {
            if self.has_partial(dim) && dim % self.head_dim != 0 {
                return invalid(format!("frontend width {dim} is not divisible by head_dim {}", self.head_dim));
            }
        }
        if self.stem_dim == 0 || self.ff_mult == 0 {
            return invalid("stem_dim and ff_mult must be positive".to_string());
        }
        Ok(())
    }

    /// Input channel count of each frontend block.
    fn frontend_dims(&self) -> impl Iterator<Item = usize> + '_ {
        (0..FRONTEND_BLOCKS).map(|i| self.stem_dim << i)
    }

    fn has_partial(&self, dim: usize) -> bool {
        self.partial_transformers && self.head_dim <= dim
    }

    fn frontend_out_dim(&self) -> usize {
        self.stem_dim << FRONTEND_BLOCKS
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    Parameter,
    /// Another module path to a parameter already listed, shared at runtime.
    Tied,
    Buffer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: candle_core::DType,
    pub kind: ParameterKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ModelState {
    Constructed,
    Bound,
    Inference,
}

#[derive(Default)]
struct SchemaBuilder {
    specs: Vec<ParameterSpec>,
    rotary_declared: bool,
}

impl SchemaBuilder {
    fn push(&mut self, name: String, shape: Vec<usize>, dtype: candle_core::DType, kind: ParameterKind) {
        self.specs.push(ParameterSpec { name, shape, dtype, kind });
    }

    fn param(&mut self, name: String, shape: Vec<usize>) {
        self.push(name, shape, candle_core::DType::F32, ParameterKind::Parameter);
    }

    fn batch_norm(&mut self, prefix: &str, channels: usize) {
        self.param(format!("{prefix}.weight"), vec![channels]);
        self.param(format!("{prefix}.bias"), vec![channels]);
        self.push(format!("{prefix}.running_mean"), vec![channels], candle_core::DType::F32, ParameterKind::Buffer);
        self.push(format!("{prefix}.running_var"), vec![channels], candle_core::DType::F32, ParameterKind::Buffer);
        self.push(format!("{prefix}.num_batches_tracked"), vec![], candle_core::DType::I64, ParameterKind::Buffer);
    }

    /// Every attention module holds the one rotary embedding of the network;
    /// only its first occurrence counts as a parameter.
    fn attention(&mut self, prefix: &str, dim: usize, heads: usize, head_dim: usize) {
        let inner = heads * head_dim;
        let rotary_kind = if self.rotary_declared { ParameterKind::Tied } else { ParameterKind::Parameter };
        self.rotary_declared = true;
        self.push(format!("{prefix}.rotary_embed.freqs"), vec![head_dim / 2], candle_core::DType::F32, rotary_kind);
        self.param(format!("{prefix}.norm.gamma"), vec![dim]);
        self.param(format!("{prefix}.to_qkv.weight"), vec![inner * 3, dim]);
        self.param(format!("{prefix}.to_gates.weight"), vec![heads, dim]);
        self.param(format!("{prefix}.to_gates.bias"), vec![heads]);
        self.param(format!("{prefix}.to_out.0.weight"), vec![dim, inner]);
    }

    fn feed_forward(&mut self, prefix: &str, dim: usize, mult: usize) {
        self.param(format!("{prefix}.net.0.gamma"), vec![dim]);
        self.param(format!("{prefix}.net.1.weight"), vec![dim * mult, dim]);
        self.param(format!("{prefix}.net.1.bias"), vec![dim * mult]);
        self.param(format!("{prefix}.net.4.weight"), vec![dim, dim * mult]);
        self.param(format!("{prefix}.net.4.bias"), vec![dim]);
    }
}

fn build_schema(config: &BeatThisConfig) -> Vec<ParameterSpec> {
    let mut schema = SchemaBuilder::default();

    schema.batch_norm("frontend.stem.bn1d", config.spect_dim);
    schema.param("frontend.stem.conv2d.weight".to_string(), vec![config.stem_dim, 1, 4, 3]);
    schema.batch_norm("frontend.stem.bn2d", config.stem_dim);

    for (i, dim) in config.frontend_dims().enumerate() {
        let prefix = format!("frontend.blocks.{i}");
        if config.has_partial(dim) {
            let heads = dim / config.head_dim;
            for direction in ["attnF", "attnT"] {
                schema.attention(&format!("{prefix}.partial.{direction}.attn"), dim, heads, config.head_dim);
                schema.feed_forward(&format!("{prefix}.partial.{direction}.ff"), dim, PARTIAL_FF_MULT);
            }
        }
        schema.param(format!("{prefix}.conv2d.weight"), vec![dim * 2, dim, 2, 3]);
        schema.batch_norm(&format!("{prefix}.norm"), dim * 2);
    }

    let projected = config.frontend_out_dim() * (config.spect_dim / FREQUENCY_REDUCTION);
    schema.param("frontend.linear.weight".to_string(), vec![config.transformer_dim, projected]);
    schema.param("frontend.linear.bias".to_string(), vec![config.transformer_dim]);

    let heads = config.transformer_dim / config.head_dim;
    for layer in 0..config.n_layers {
        schema.attention(&format!("transformer_blocks.layers.{layer}.0"), config.transformer_dim, heads, config.head_dim);
        schema.feed_forward(&format!("transformer_blocks.layers.{layer}.1"), config.transformer_dim, config.ff_mult);
    }
    schema.param("transformer_blocks.norm.gamma".to_string(), vec![config.transformer_dim]);

    schema.param("task_heads.beat_downbeat_lin.weight".to_string(), vec![2, config.transformer_dim]);
    schema.param("task_heads.beat_downbeat_lin.bias".to_string(), vec![2]);

    schema.specs
}

/// Graph outputs of one trace, rooted at a single input.
pub struct TracedGraph {
    pub input: Arc<InputTensor>,
    pub beat: Arc<dyn Tensor>,
    pub downbeat: Arc<dyn Tensor>,
}

pub struct BeatThis {
    config: BeatThisConfig,
    parameters: Vec<ParameterSpec>,
    weights: Option<Arc<BTreeMap<String, candle_core::Tensor>>>,
    state: ModelState,
}

impl BeatThis {
    pub fn new(config: BeatThisConfig) -> Result<Self, Error> {
        config.validate()?;
        let parameters = build_schema(&config);
        Ok(Self {
            config,
            parameters,
            weights: None,
            state: ModelState::Constructed,
        })
    }

    pub fn config(&self) -> &BeatThisConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// Where the bound weights live; `None` before binding.
    pub fn device(&self) -> Option<candle_core::Device> {
        let weights = self.weights.as_ref()?;
        weights.values().next().map(|x| x.device().clone())
    }

    /// Every entry a state dict for this architecture holds, in module order.
    pub fn expected_parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    /// Number of distinct trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.parameters.iter()
            .filter(|x| x.kind == ParameterKind::Parameter)
            .map(|x| x.shape.iter().product::<usize>())
            .sum()
    }

    /// Binds every parameter and buffer. Nothing is bound unless the state dict
    /// matches the schema exactly; all discrepancies are reported together.
    pub fn load_state_dict(&mut self, state_dict: StateDict) -> Result<(), Error> {
        let mut mismatch = StateDictMismatch::default();
        for param in &self.parameters {
            match state_dict.get(&param.name) {
                None => mismatch.missing.push(param.name.clone()),
                Some(tensor) if tensor.dims() != param.shape.as_slice() => {
                    mismatch.shape_mismatches.push((param.name.clone(), tensor.dims().to_vec(), param.shape.clone()));
                }
                Some(_) => {}
            }
        }
        let known: std::collections::HashSet<&str> = self.parameters.iter().map(|x| x.name.as_str()).collect();
        mismatch.unexpected = state_dict.keys().filter(|x| !known.contains(x.as_str())).cloned().collect();
        if !mismatch.is_empty() {
            return Err(mismatch.into());
        }

        let mut weights = BTreeMap::new();
        for param in &self.parameters {
            let tensor = &state_dict[&param.name];
            let tensor = if tensor.dtype() == param.dtype {
                tensor.clone()
            } else {
                log::debug!("converting {} from {:?} to {:?}", param.name, tensor.dtype(), param.dtype);
                tensor.to_dtype(param.dtype)?
            };
            weights.insert(param.name.clone(), tensor);
        }
        self.weights = Some(Arc::new(weights));
        if self.state == ModelState::Constructed {
            self.state = ModelState::Bound;
        }
        Ok(())
    }

    /// Switches to inference behavior: no dropout, batch norm on running statistics.
    pub fn eval(&mut self) -> Result<(), Error> {
        match self.state {
            ModelState::Constructed => Err(Error::ModelState { expected: ModelState::Bound, actual: self.state }),
            _ => {
                self.state = ModelState::Inference;
                Ok(())
            }
        }
    }

    fn weight_manager(&self) -> Result<TensorMapWeightManager, Error> {
        match (&self.weights, self.state) {
            (Some(weights), ModelState::Inference) => Ok(TensorMapWeightManager::new(weights.clone())),
            _ => Err(Error::ModelState { expected: ModelState::Inference, actual: self.state }),
        }
    }

    /// Builds the inference graph for a `(1, time, spect_dim)` input.
    pub fn trace(&self, input_name: &str, time: Arc<Dimension>) -> Result<TracedGraph, Error> {
        let wm = self.weight_manager()?;
        let input = InputTensor::new(
            input_name.to_string(),
            DType::F32,
            Shape::new(vec![Dimension::fixed(1), time, Dimension::fixed(self.config.spect_dim)]),
        );

        let mut x = stem(&wm.prefix("frontend.stem"), input.clone())?;
        for (i, dim) in self.config.frontend_dims().enumerate() {
            let partial_heads = if self.config.has_partial(dim) { Some(dim / self.config.head_dim) } else { None };
            x = frontend_block(&wm.prefix(&format!("frontend.blocks.{i}")), x, partial_heads, self.config.head_dim)?;
        }

        // b c f t -> b t (c f)
        let x = transpose(x, &[0, 3, 1, 2])?;
        let (batch, time, channels, freqs) = (x.shape()[0].clone(), x.shape()[1].clone(), x.shape()[2].resolve()?, x.shape()[3].resolve()?);
        let x = reshape(x, vec![batch, time, Dimension::fixed(channels * freqs)])?;
        let mut x = linear(&wm.prefix("frontend.linear"), x)?;

        let heads = self.config.transformer_dim / self.config.head_dim;
        for layer in 0..self.config.n_layers {
            let layer_wm = wm.prefix(&format!("transformer_blocks.layers.{layer}"));
            let attended = attention(&layer_wm.prefix("0"), x.clone(), heads, self.config.head_dim)?;
            x = operators::add(x, attended)?;
            let fed = feed_forward(&layer_wm.prefix("1"), x.clone())?;
            x = operators::add(x, fed)?;
        }
        let x = rms_norm(&wm.prefix("transformer_blocks.norm"), x)?;

        // b t c -> c b t
        let logits = linear(&wm.prefix("task_heads.beat_downbeat_lin"), x)?;
        let logits = transpose(logits, &[2, 0, 1])?;
        let beat = select(logits.clone(), 0, 0)?;
        let downbeat = select(logits, 0, 1)?;
        let beat: Arc<dyn Tensor> = if self.config.sum_head {
            operators::add(beat, downbeat.clone())?
        } else {
            beat
        };

        Ok(TracedGraph { input, beat, downbeat })
    }

    /// Runs the model on a `(1, time, spect_dim)` spectrogram.
    pub fn forward(&self, spectrogram: &candle_core::Tensor) -> Result<HashMap<String, candle_core::Tensor>, Error> {
        let dims = spectrogram.dims();
        if dims.len() != 3 || dims[0] != 1 || dims[1] == 0 || dims[2] != self.config.spect_dim {
            return Err(Error::InvalidInput(format!(
                "expected a (1, time, {}) spectrogram, got {:?}", self.config.spect_dim, dims
            )));
        }
        let graph = self.trace(INPUT_NAME, Dimension::dynamic("time"))?;
        let mut inputs = HashMap::new();
        inputs.insert(INPUT_NAME.to_string(), spectrogram.to_dtype(candle_core::DType::F32)?);
        let outputs = onnx_graph::eval::evaluate(
            &[(BEAT_OUTPUT, graph.beat), (DOWNBEAT_OUTPUT, graph.downbeat)],
            &inputs,
        )?;
        Ok(outputs)
    }
}

fn stem(wm: &impl WeightManager, x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    // b t f -> b f t
    let x = transpose(x, &[0, 2, 1])?;
    let x = batch_norm(&wm.prefix("bn1d"), x, BATCH_NORM_EPSILON)?;
    let x = unsqueeze(x, 1)?;
    let x = conv2d(&wm.prefix("conv2d"), x, [4, 1], [0, 1, 0, 1])?;
    let x = batch_norm(&wm.prefix("bn2d"), x, BATCH_NORM_EPSILON)?;
    gelu(x)
}

fn frontend_block(wm: &impl WeightManager, x: Arc<dyn Tensor>, partial_heads: Option<usize>, head_dim: usize) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let mut x = x;
    if let Some(heads) = partial_heads {
        x = partial_roformer(&wm.prefix("partial.attnF"), x, Direction::Frequency, heads, head_dim)?;
        x = partial_roformer(&wm.prefix("partial.attnT"), x, Direction::Time, heads, head_dim)?;
    }
    let x = conv2d(&wm.prefix("conv2d"), x, [2, 1], [0, 1, 0, 1])?;
    let x = batch_norm(&wm.prefix("norm"), x, BATCH_NORM_EPSILON)?;
    gelu(x)
}

#[derive(Clone, Copy)]
enum Direction {
    Frequency,
    Time,
}

/// Attention and feed-forward along one axis of a `(1, c, f, t)` feature map.
fn partial_roformer(wm: &impl WeightManager, x: Arc<dyn Tensor>, direction: Direction, heads: usize, head_dim: usize) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let shape = x.shape().clone();
    let (channels, freqs, time) = (shape[1].clone(), shape[2].clone(), shape[3].clone());
    let (perm_in, rows, cols, perm_out): ([usize; 4], _, _, [usize; 4]) = match direction {
        // b c f t -> (b t) f c
        Direction::Frequency => ([0, 3, 2, 1], time, freqs, [0, 3, 2, 1]),
        // b c f t -> (b f) t c
        Direction::Time => ([0, 2, 3, 1], freqs, time, [0, 3, 1, 2]),
    };
    let h = transpose(x, &perm_in)?;
    let h = reshape(h, vec![rows.clone(), cols.clone(), channels.clone()])?;
    let attended = attention(&wm.prefix("attn"), h.clone(), heads, head_dim)?;
    let h: Arc<dyn Tensor> = operators::add(h, attended)?;
    let fed = feed_forward(&wm.prefix("ff"), h.clone())?;
    let h: Arc<dyn Tensor> = operators::add(h, fed)?;
    let h = reshape(h, vec![Dimension::fixed(1), rows, cols, channels])?;
    transpose(h, &perm_out)
}

fn feed_forward(wm: &impl WeightManager, x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let x = rms_norm(&wm.prefix("net.0"), x)?;
    let x = linear(&wm.prefix("net.1"), x)?;
    let x = gelu(x)?;
    linear(&wm.prefix("net.4"), x)
}

/// Interleaved `cos`/`sin` tables of shape `(n, head_dim)` for the sequence axis of `reference`.
fn rotary_tables(wm: &impl WeightManager, reference: Arc<dyn Tensor>, seq_axis: usize) -> Result<(Arc<dyn Tensor>, Arc<dyn Tensor>), onnx_graph::Error> {
    let freqs = wm.get_tensor("freqs")?;
    let half = freqs.shape()[0].clone();
    let seq = positions(reference, seq_axis)?;
    let angles: Arc<dyn Tensor> = operators::mul(unsqueeze(seq, 1)?, freqs)?;
    let n = angles.shape()[0].clone();
    // (n, d/2) -> (n, d/2, 2) -> (n, d), each frequency repeated for its pair
    let pairs = unsqueeze(angles, 2)?;
    let pairs = Concat::new(None, vec![pairs.clone(), pairs], 2)?;
    let angles = reshape(pairs, vec![n, Dimension::fixed(half.resolve()? * 2)])?;
    let cos: Arc<dyn Tensor> = Unary::new(None, WhichUnaryOperation::Cos, angles.clone())?;
    let sin: Arc<dyn Tensor> = Unary::new(None, WhichUnaryOperation::Sin, angles)?;
    Ok((cos, sin))
}

/// `(x1, x2) -> (-x2, x1)` over adjacent pairs of the last axis.
fn rotate_half(x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let shape = x.shape().clone();
    let rank = shape.rank();
    let last = shape[rank - 1].resolve()?;
    let mut paired = shape.dims[..rank - 1].to_vec();
    paired.push(Dimension::fixed(last / 2));
    paired.push(Dimension::fixed(2));
    let pairs = reshape(x, paired)?;
    let x1 = select(pairs.clone(), rank as i64, 0)?;
    let x2 = select(pairs, rank as i64, 1)?;
    let neg_x2 = Unary::new(None, WhichUnaryOperation::Neg, x2)?;
    let rotated = Concat::new(None, vec![unsqueeze(neg_x2, rank as i64)?, unsqueeze(x1, rank as i64)?], rank as i64)?;
    reshape(rotated, shape.dims.clone())
}

fn apply_rotary(x: Arc<dyn Tensor>, cos: &Arc<dyn Tensor>, sin: &Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let rotated = rotate_half(x.clone())?;
    let a = operators::mul(x, cos.clone())?;
    let b = operators::mul(rotated, sin.clone())?;
    Ok(operators::add(a, b)?)
}

/// Gated multi-head self-attention with rotary positions over `(b, n, dim)`.
fn attention(wm: &impl WeightManager, x: Arc<dyn Tensor>, heads: usize, head_dim: usize) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let batch = x.shape()[0].clone();
    let seq = x.shape()[1].clone();

    let x = rms_norm(&wm.prefix("norm"), x)?;

    // b n (qkv h d) -> qkv b h n d
    let qkv = linear(&wm.prefix("to_qkv"), x.clone())?;
    let qkv = reshape(qkv, vec![batch.clone(), seq.clone(), Dimension::fixed(3), Dimension::fixed(heads), Dimension::fixed(head_dim)])?;
    let qkv = transpose(qkv, &[2, 0, 3, 1, 4])?;
    let q = select(qkv.clone(), 0, 0)?;
    let k = select(qkv.clone(), 0, 1)?;
    let v = select(qkv, 0, 2)?;

    let (cos, sin) = rotary_tables(&wm.prefix("rotary_embed"), q.clone(), 2)?;
    let q = apply_rotary(q, &cos, &sin)?;
    let k = apply_rotary(k, &cos, &sin)?;

    let scores = MatMul::new(None, q, transpose(k, &[0, 1, 3, 2])?)?;
    let scores = operators::mul(scores, constant_f32((head_dim as f32).powf(-0.5)))?;
    let probs = Softmax::new(None, scores, -1)?;
    let out = MatMul::new(None, probs, v)?;

    // b n h -> b h n 1
    let gates = linear(&wm.prefix("to_gates"), x)?;
    let gates = unsqueeze(transpose(gates, &[0, 2, 1])?, 3)?;
    let gates = Unary::new(None, WhichUnaryOperation::Sigmoid, gates)?;
    let out = operators::mul(out, gates)?;

    // b h n d -> b n (h d)
    let out = transpose(out, &[0, 2, 1, 3])?;
    let out = reshape(out, vec![batch, seq, Dimension::fixed(heads * head_dim)])?;
    linear(&wm.prefix("to_out.0"), out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;

    pub(crate) fn small_config() -> BeatThisConfig {
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

    pub(crate) fn random_state_dict(model: &BeatThis) -> StateDict {
        let mut state = StateDict::new();
        for param in model.expected_parameters() {
            let tensor = match param.dtype {
                candle_core::DType::I64 => candle_core::Tensor::zeros(param.shape.as_slice(), candle_core::DType::I64, &Device::Cpu).unwrap(),
                _ if param.name.ends_with("running_var") => candle_core::Tensor::ones(param.shape.as_slice(), candle_core::DType::F32, &Device::Cpu).unwrap(),
                _ => candle_core::Tensor::randn(0f32, 0.1, param.shape.as_slice(), &Device::Cpu).unwrap(),
            };
            state.insert(param.name.clone(), tensor);
        }
        state
    }

    #[test]
    fn default_schema_matches_published_architecture() {
        let model = BeatThis::new(BeatThisConfig::default()).unwrap();
        let find = |name: &str| model.expected_parameters().iter().find(|x| x.name == name).unwrap().shape.clone();
        assert_eq!(find("frontend.stem.conv2d.weight"), vec![32, 1, 4, 3]);
        assert_eq!(find("frontend.blocks.2.conv2d.weight"), vec![256, 128, 2, 3]);
        assert_eq!(find("frontend.linear.weight"), vec![512, 1024]);
        assert_eq!(find("transformer_blocks.layers.5.0.to_qkv.weight"), vec![1536, 512]);
        assert_eq!(find("transformer_blocks.layers.0.1.net.1.weight"), vec![2048, 512]);
        assert_eq!(find("frontend.blocks.0.partial.attnT.attn.rotary_embed.freqs"), vec![16]);
        assert_eq!(find("frontend.stem.bn1d.num_batches_tracked"), Vec::<usize>::new());
        let names: std::collections::HashSet<_> = model.expected_parameters().iter().map(|x| &x.name).collect();
        assert_eq!(names.len(), model.expected_parameters().len());
    }

    #[test]
    fn tied_rotary_frequencies_are_counted_once() {
        let model = BeatThis::new(small_config()).unwrap();
        let rotary: Vec<&ParameterSpec> = model.expected_parameters().iter()
            .filter(|x| x.name.ends_with("rotary_embed.freqs"))
            .collect();
        // Two per frontend block, one per transformer layer.
        assert_eq!(rotary.len(), 3 * 2 + 2);
        assert_eq!(rotary[0].name, "frontend.blocks.0.partial.attnF.attn.rotary_embed.freqs");
        assert_eq!(rotary[0].kind, ParameterKind::Parameter);
        assert!(rotary[1..].iter().all(|x| x.kind == ParameterKind::Tied));

        let without_rotary: usize = model.expected_parameters().iter()
            .filter(|x| x.kind == ParameterKind::Parameter && !x.name.ends_with("rotary_embed.freqs"))
            .map(|x| x.shape.iter().product::<usize>())
            .sum();
        assert_eq!(model.num_parameters(), without_rotary + small_config().head_dim / 2);
    }

    #[test]
    fn rejects_spectrogram_width_not_divisible_by_reduction() {
        let config = BeatThisConfig { spect_dim: 100, ..small_config() };
        assert!(matches!(BeatThis::new(config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn binding_reports_every_discrepancy() {
        let mut model = BeatThis::new(small_config()).unwrap();
        let mut state = random_state_dict(&model);
        state.remove("frontend.linear.bias");
        state.insert("frontend.linear.weight".to_string(), candle_core::Tensor::zeros((3, 3), candle_core::DType::F32, &Device::Cpu).unwrap());
        state.insert("beat_loss.pos_weight".to_string(), candle_core::Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap());
        match model.load_state_dict(state) {
            Err(Error::StateDictMismatch(mismatch)) => {
                assert_eq!(mismatch.missing, vec!["frontend.linear.bias".to_string()]);
                assert_eq!(mismatch.unexpected, vec!["beat_loss.pos_weight".to_string()]);
                assert_eq!(mismatch.shape_mismatches.len(), 1);
                assert_eq!(mismatch.shape_mismatches[0].0, "frontend.linear.weight");
                let message = mismatch.to_string();
                assert!(message.contains("Missing key(s)"));
                assert!(message.contains("Unexpected key(s)"));
            }
            other => panic!("expected a mismatch, got {other:?}"),
        }
        assert_eq!(model.state(), ModelState::Constructed);
    }

    #[test]
    fn lifecycle_is_enforced() {
        let mut model = BeatThis::new(small_config()).unwrap();
        assert!(matches!(model.eval(), Err(Error::ModelState { .. })));
        assert!(model.device().is_none());
        model.load_state_dict(random_state_dict(&model)).unwrap();
        assert_eq!(model.state(), ModelState::Bound);
        assert!(model.device().unwrap().is_cpu());
        assert!(model.trace(INPUT_NAME, Dimension::dynamic("time")).is_err());
        model.eval().unwrap();
        assert_eq!(model.state(), ModelState::Inference);
        assert!(model.trace(INPUT_NAME, Dimension::dynamic("time")).is_ok());
    }

    #[test]
    fn double_precision_weights_are_bound_as_f32() {
        let mut model = BeatThis::new(small_config()).unwrap();
        let mut state = random_state_dict(&model);
        let gamma = state["transformer_blocks.norm.gamma"].to_dtype(candle_core::DType::F64).unwrap();
        state.insert("transformer_blocks.norm.gamma".to_string(), gamma);
        model.load_state_dict(state).unwrap();
        model.eval().unwrap();
        let graph = model.trace(INPUT_NAME, Dimension::fixed(7)).unwrap();
        assert_eq!(graph.beat.dtype(), DType::F32);
    }

    #[test]
    fn forward_yields_one_value_per_frame() {
        let mut model = BeatThis::new(small_config()).unwrap();
        model.load_state_dict(random_state_dict(&model)).unwrap();
        model.eval().unwrap();
        let input = candle_core::Tensor::randn(0f32, 1.0, (1, 9, 128), &Device::Cpu).unwrap();
        let outputs = model.forward(&input).unwrap();
        assert_eq!(outputs[BEAT_OUTPUT].dims(), &[1, 9]);
        assert_eq!(outputs[DOWNBEAT_OUTPUT].dims(), &[1, 9]);
        let wrong = candle_core::Tensor::zeros((1, 9, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(model.forward(&wrong), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn summed_head_adds_downbeat_to_beat() {
        let mut summed = BeatThis::new(small_config()).unwrap();
        let state = random_state_dict(&summed);
        let mut separate = BeatThis::new(BeatThisConfig { sum_head: false, ..small_config() }).unwrap();
        summed.load_state_dict(state.clone()).unwrap();
        separate.load_state_dict(state).unwrap();
        summed.eval().unwrap();
        separate.eval().unwrap();
        let input = candle_core::Tensor::randn(0f32, 1.0, (1, 4, 128), &Device::Cpu).unwrap();
        let a = summed.forward(&input).unwrap();
        let b = separate.forward(&input).unwrap();
        let expected = (&b[BEAT_OUTPUT] + &b[DOWNBEAT_OUTPUT]).unwrap();
        let diff = (&a[BEAT_OUTPUT] - &expected).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-4);
    }
}
