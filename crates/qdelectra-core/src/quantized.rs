//! Quantization-aware linear layers for the student.
//!
//! Weights are fake-quantized to symmetric signed 8-bit on every forward pass
//! (per-tensor scale `max|w| / 127`).  The rounding is wrapped in a
//! straight-through estimator, `w + detach(q(w) - w)`, so the forward pass
//! sees quantized weights while gradients flow to the full-precision master
//! copy unchanged.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Largest magnitude representable by a signed 8-bit code, excluding -128.
const INT8_MAX: f64 = 127.0;
/// Floor for the scale so an all-zero weight does not divide by zero.
const MIN_SCALE: f32 = 1e-8;

/// Whether a model's linear layers run in full precision or fake-quantized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    #[default]
    Full,
    Int8,
}

/// A linear layer that optionally fake-quantizes its weight.
#[derive(Debug, Clone)]
pub struct QLinear {
    inner: Linear,
    mode: QuantMode,
}

impl QLinear {
    pub fn new(in_dim: usize, out_dim: usize, mode: QuantMode, vb: VarBuilder) -> Result<Self> {
        let inner = candle_nn::linear(in_dim, out_dim, vb)?;
        Ok(Self { inner, mode })
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.mode {
            QuantMode::Full => self.inner.forward(xs),
            QuantMode::Int8 => {
                let weight = fake_quantize(self.inner.weight())?;
                Linear::new(weight, self.inner.bias().cloned()).forward(xs)
            }
        }
    }
}

/// Round `w` onto the symmetric int8 grid and map it back to floats, with a
/// straight-through gradient.
pub fn fake_quantize(w: &Tensor) -> Result<Tensor> {
    let scale = (w.abs()?.max_all()? / INT8_MAX)?.maximum(MIN_SCALE)?;
    let quantized = w
        .broadcast_div(&scale)?
        .round()?
        .clamp(-INT8_MAX as f32, INT8_MAX as f32)?
        .broadcast_mul(&scale)?;
    let delta = quantized.sub(w)?.detach();
    w.add(&delta)
}
