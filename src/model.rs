//! Model registry and the reference flip-flop network.
//!
//! The training loop only knows the [`Model`] trait: a forward pass from a
//! `(samples, batch, 1)` signal tensor to `(blocks, batch, nstate)`
//! transition scores, and the downsampling stride relating the two time
//! axes. Parameters live in the [`candle_nn::VarMap`] the model was built
//! from, which the trainer owns; that is what the optimizer steps and the
//! checkpoint manager serializes.
//!
//! Architectures are resolved by name through [`ModelKind`] before the
//! loop starts, so a run configuration fully determines the network.

use candle_core::Tensor;
use candle_nn::rnn::{gru, GRUConfig, GRU, RNN};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{FlipflopError, Result};
use crate::flipflop::nstate_flipflop;

/// A trainable signal-to-transition-scores network.
pub trait Model {
    /// Forward pass. Input `(samples, batch, 1)`, output
    /// `(samples / stride, batch, nstate)`.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Downsampling factor between input samples and output blocks.
    fn stride(&self) -> usize;
}

/// Registry key selecting a network architecture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Strided convolution followed by a stack of direction-alternating
    /// GRU layers.
    #[default]
    ConvGru,
}

/// Build the configured architecture over the given parameter store.
///
/// # Errors
///
/// Fails when the hyperparameters are unusable or parameter creation
/// fails.
pub fn build_model(
    config: &ModelConfig,
    nbase: usize,
    vb: VarBuilder,
) -> Result<Box<dyn Model>> {
    match config.kind {
        ModelKind::ConvGru => Ok(Box::new(ConvGruFlipflop::new(config, nbase, vb)?)),
    }
}

/// Convolutional front end plus five GRU layers, alternating direction so
/// every block sees context from both sides, closing with a linear map to
/// flip-flop transition scores.
pub struct ConvGruFlipflop {
    conv: Conv1d,
    layers: Vec<(GRU, bool)>,
    out: Linear,
    stride: usize,
}

impl ConvGruFlipflop {
    /// Number of recurrent layers; odd so the final layer runs reversed,
    /// matching the front-to-back emphasis of the reference stack.
    const GRU_LAYERS: [bool; 5] = [true, false, true, false, true];

    fn new(config: &ModelConfig, nbase: usize, vb: VarBuilder) -> Result<Self> {
        if config.stride == 0 || config.size == 0 || config.winlen == 0 {
            return Err(FlipflopError::Model(format!(
                "stride, size and winlen must be positive (got {}, {}, {})",
                config.stride, config.size, config.winlen
            )));
        }
        if config.winlen % 2 == 0 {
            return Err(FlipflopError::Model(format!(
                "window length must be odd, got {}",
                config.winlen
            )));
        }
        let conv = conv1d(
            1,
            config.size,
            config.winlen,
            Conv1dConfig {
                padding: (config.winlen - 1) / 2,
                stride: config.stride,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let mut layers = Vec::with_capacity(Self::GRU_LAYERS.len());
        for (i, &reversed) in Self::GRU_LAYERS.iter().enumerate() {
            let layer = gru(
                config.size,
                config.size,
                GRUConfig::default(),
                vb.pp(format!("gru{i}")),
            )?;
            layers.push((layer, reversed));
        }
        let out = candle_nn::linear(config.size, nstate_flipflop(nbase), vb.pp("out"))?;
        Ok(Self {
            conv,
            layers,
            out,
            stride: config.stride,
        })
    }

    fn run_gru(layer: &GRU, input: &Tensor, reversed: bool) -> Result<Tensor> {
        let input = if reversed {
            reverse_time(input)?
        } else {
            input.clone()
        };
        let states = layer.seq(&input)?;
        let hidden: Vec<Tensor> = states.iter().map(|s| s.h().clone()).collect();
        let output = Tensor::stack(&hidden, 1)?;
        if reversed {
            reverse_time(&output)
        } else {
            Ok(output)
        }
    }
}

impl Model for ConvGruFlipflop {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        // (samples, batch, 1) -> (batch, 1, samples) for the convolution.
        let x = input.permute((1, 2, 0))?;
        let x = self.conv.forward(&x)?.tanh()?;
        // (batch, size, blocks) -> (batch, blocks, size) for the GRUs.
        let mut x = x.transpose(1, 2)?;
        for (layer, reversed) in &self.layers {
            x = Self::run_gru(layer, &x, *reversed)?;
        }
        let scores = self.out.forward(&x)?;
        // Back to (blocks, batch, nstate).
        Ok(scores.permute((1, 0, 2))?)
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

/// Reverse a `(batch, time, features)` tensor along its time axis.
fn reverse_time(input: &Tensor) -> Result<Tensor> {
    let steps = input.dim(1)?;
    #[allow(clippy::cast_possible_truncation)]
    let index: Vec<u32> = (0..steps as u32).rev().collect();
    let index = Tensor::from_vec(index, (steps,), input.device())?;
    Ok(input.contiguous()?.index_select(&index, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> ModelConfig {
        ModelConfig {
            kind: ModelKind::ConvGru,
            size: 8,
            winlen: 5,
            stride: 2,
        }
    }

    #[test]
    fn test_forward_shape_contract() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_model(&small_config(), 4, vb).unwrap();

        let input = Tensor::zeros((64, 3, 1), DType::F32, &device).unwrap();
        let output = model.forward(&input).unwrap();
        assert_eq!(output.dims(), &[32, 3, 40]);
        assert_eq!(model.stride(), 2);
    }

    #[test]
    fn test_parameters_are_registered() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = build_model(&small_config(), 4, vb).unwrap();
        // Conv + 5 GRU layers + output head all contribute variables.
        assert!(varmap.all_vars().len() >= 13);
    }

    #[test]
    fn test_rejects_bad_hyperparameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = small_config();
        config.stride = 0;
        assert!(build_model(&config, 4, vb.clone()).is_err());
        config.stride = 2;
        config.winlen = 4;
        assert!(build_model(&config, 4, vb).is_err());
    }

    #[test]
    fn test_reverse_time() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1f32, 2.0, 3.0], (1, 3, 1), &device).unwrap();
        let r = reverse_time(&t).unwrap();
        assert_eq!(
            r.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![3.0, 2.0, 1.0]
        );
    }
}
