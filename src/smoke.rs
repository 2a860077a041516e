use std::fmt;
use candle_core::{Device, Tensor};
use crate::model::{BeatThis, BEAT_OUTPUT, DOWNBEAT_OUTPUT};
use crate::{ConversionConfig, Error};

#[derive(Clone, Debug)]
pub struct OutputSummary {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: candle_core::DType,
    pub min: f32,
    pub max: f32,
}

impl fmt::Display for OutputSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: shape {:?}, dtype {:?}, range [{:.3}, {:.3}]", self.name, self.shape, self.dtype, self.min, self.max)
    }
}

#[derive(Clone, Debug)]
pub struct SmokeReport {
    pub input_shape: Vec<usize>,
    pub outputs: Vec<OutputSummary>,
}

impl SmokeReport {
    pub fn output(&self, name: &str) -> Option<&OutputSummary> {
        self.outputs.iter().find(|x| x.name == name)
    }
}

/// Standard-normal spectrogram of the configured smoke-test shape.
pub fn synthetic_input(config: &ConversionConfig) -> Result<Tensor, Error> {
    Ok(Tensor::randn(0f32, 1f32, config.smoke_input_shape(), &Device::Cpu)?)
}

fn summarize(name: &str, value: &Tensor, batch: usize, time: usize) -> Result<OutputSummary, Error> {
    if value.dims() != [batch, time] {
        return Err(Error::SmokeTest(format!("{name} has shape {:?}, expected [{batch}, {time}]", value.dims())));
    }
    if value.dtype() != candle_core::DType::F32 {
        return Err(Error::SmokeTest(format!("{name} has dtype {:?}, expected F32", value.dtype())));
    }
    let min = value.min_all()?.to_scalar::<f32>()?;
    let max = value.max_all()?.to_scalar::<f32>()?;
    if !min.is_finite() || !max.is_finite() {
        return Err(Error::SmokeTest(format!("{name} contains non-finite values")));
    }
    Ok(OutputSummary {
        name: name.to_string(),
        shape: value.dims().to_vec(),
        dtype: value.dtype(),
        min,
        max,
    })
}

/// Runs one inference pass and checks both heads produce a `(batch, time)` f32 map.
pub fn smoke_test(model: &BeatThis, input: &Tensor) -> Result<SmokeReport, Error> {
    let (batch, time, _) = input.dims3()?;
    let outputs = model.forward(input)?;
    let mut summaries = vec![];
    for name in [BEAT_OUTPUT, DOWNBEAT_OUTPUT] {
        let value = outputs.get(name).ok_or_else(|| Error::SmokeTest(format!("missing output {name}")))?;
        summaries.push(summarize(name, value, batch, time)?);
    }
    Ok(SmokeReport {
        input_shape: input.dims().to_vec(),
        outputs: summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{random_state_dict, small_config};

    #[test]
    fn synthetic_input_has_configured_shape() {
        let input = synthetic_input(&ConversionConfig::default()).unwrap();
        assert_eq!(input.dims(), &[1, 300, 128]);
        assert_eq!(input.dtype(), candle_core::DType::F32);
    }

    #[test]
    fn reports_both_heads() {
        let mut model = BeatThis::new(small_config()).unwrap();
        model.load_state_dict(random_state_dict(&model)).unwrap();
        model.eval().unwrap();
        let input = Tensor::randn(0f32, 1f32, (1, 12, 128), &Device::Cpu).unwrap();
        let report = smoke_test(&model, &input).unwrap();
        assert_eq!(report.input_shape, vec![1, 12, 128]);
        let beat = report.output(BEAT_OUTPUT).unwrap();
        assert_eq!(beat.shape, vec![1, 12]);
        assert!(beat.min <= beat.max);
        assert_eq!(report.output(DOWNBEAT_OUTPUT).unwrap().shape, vec![1, 12]);
    }

    #[test]
    fn unbound_model_fails() {
        let model = BeatThis::new(small_config()).unwrap();
        let input = Tensor::zeros((1, 4, 128), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(smoke_test(&model, &input), Err(Error::ModelState { .. })));
    }
}
