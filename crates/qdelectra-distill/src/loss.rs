//! Composite distillation loss.
//!
//! Five terms are computed from one [`DistillOutputs`]:
//!
//! | Term | Definition |
//! |---|---|
//! | `t_discriminator_loss` | teacher task loss × λ |
//! | `s_discriminator_loss` | student task loss × λ |
//! | `soft_logits_loss` | BCE(σ(s/T), σ(t/T)) × T² × soft_logits_factor |
//! | `hidden_layers_loss` | Σ MSE(s2t_hidden, t_hidden) over the first N layers |
//! | `attention_loss` | Σ per-head-group MSE over the first N layers × atten_layers_factor |
//!
//! Teacher tensors are detached wherever they act as targets.  How the terms
//! are combined depends on [`DistillFlags`].

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use qdelectra_core::{DistillModelConfig, DistillOutputs};

use crate::error::{DistillError, DistillResult};
use crate::tasks::OutputMode;
use crate::writer::ScalarWriter;

// ── Configuration ─────────────────────────────────────────────────────────────

pub const SCALAR_GROUP: &str = "data/scalar_group";

/// `torch.nn.BCELoss` clamps log-probabilities at this value.
const LOG_FLOOR: f64 = -100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DistillFlags {
    /// Use the distillation terms at all; otherwise train on the student loss.
    pub distill: bool,
    /// Distil one more layer per epoch; soft logits join once every layer is in.
    pub gradually_distill: bool,
    /// Two-stage TinyBERT schedule instead of the joint objective.
    pub imitate_tinybert: bool,
    /// TinyBERT prediction-layer stage (vs. the intermediate-layer stage).
    pub pred_distill: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub temperature: f64,
    pub lambda: f64,
    pub soft_logits_factor: f64,
    pub atten_layers_factor: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self { temperature: 1.0, lambda: 1.0, soft_logits_factor: 1.0, atten_layers_factor: 1.0 }
    }
}

// ── Step inputs and outputs ───────────────────────────────────────────────────

/// Per-step inputs that are not model outputs.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub global_step: usize,
    /// 1-based.
    pub epoch: usize,
    pub lr: f64,
}

/// Scalar values of every term after weighting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossBreakdown {
    pub t_loss: f64,
    pub s_loss: f64,
    pub soft_logits: f64,
    pub hidden: f64,
    pub attention: f64,
    pub total: f64,
}

// ── Loss engine ───────────────────────────────────────────────────────────────

pub struct DistillLoss {
    flags: DistillFlags,
    weights: LossWeights,
    output_mode: OutputMode,
    s_heads: usize,
    head_groups: usize,
    max_distilled_layers: usize,
    writer: Box<dyn ScalarWriter>,
}

impl DistillLoss {
    /// Fails when the teacher head count is not a multiple of the student's,
    /// or when there are more teacher head groups than student heads.
    pub fn new(
        model: &DistillModelConfig,
        output_mode: OutputMode,
        flags: DistillFlags,
        weights: LossWeights,
        writer: Box<dyn ScalarWriter>,
    ) -> DistillResult<Self> {
        let t_heads = model.teacher.num_attention_heads;
        let s_heads = model.student.num_attention_heads;
        if s_heads == 0 || t_heads % s_heads != 0 {
            return Err(DistillError::HeadMismatch { t_heads, s_heads });
        }
        let head_groups = t_heads / s_heads;
        if head_groups > s_heads {
            return Err(DistillError::config(
                "num_attention_heads",
                format!("{head_groups} teacher head groups but only {s_heads} student heads"),
            ));
        }

        Ok(Self {
            flags,
            weights,
            output_mode,
            s_heads,
            head_groups,
            max_distilled_layers: model.student.num_hidden_layers + 1,
            writer,
        })
    }

    pub fn flags(&self) -> DistillFlags {
        self.flags
    }

    /// Layers distilled at `epoch`.
    pub fn distilled_layers(&self, epoch: usize) -> usize {
        if self.flags.gradually_distill {
            epoch
        } else {
            self.max_distilled_layers
        }
    }

    /// Total loss for one step, ready for `backward`.
    pub fn compute(&mut self, outputs: &DistillOutputs, ctx: StepContext) -> DistillResult<(Tensor, LossBreakdown)> {
        let s_loss = outputs.student.loss.mean_all()?;

        if !self.flags.distill {
            let total = scalar(&s_loss)?;
            self.log(
                BTreeMap::from([("total_loss".to_string(), total), ("lr".to_string(), ctx.lr)]),
                ctx.global_step,
            );
            let breakdown = LossBreakdown { s_loss: total, total, ..Default::default() };
            return Ok((s_loss, breakdown));
        }

        let t_loss = outputs.teacher.loss.mean_all()?;
        let n_layers = self.distilled_layers(ctx.epoch);
        let zero = s_loss.zeros_like()?;

        let mut soft_logits = self.soft_logits_loss(&outputs.student.logits, &outputs.teacher.logits)?;
        if self.flags.gradually_distill && n_layers < self.max_distilled_layers {
            soft_logits = soft_logits.zeros_like()?;
        }
        let hidden =
            hidden_layers_loss(zero.clone(), &outputs.s2t_hidden_states, &outputs.teacher.hidden_states, n_layers)?;
        let attention =
            self.attention_loss(zero, &outputs.student.attentions, &outputs.teacher.attentions, n_layers)?;

        let t_loss = (t_loss * self.weights.lambda)?;
        let s_loss = (s_loss * self.weights.lambda)?;
        let soft_logits = (soft_logits * self.weights.soft_logits_factor)?;
        let attention = (attention * self.weights.atten_layers_factor)?;

        let total = if self.flags.imitate_tinybert {
            if !self.flags.pred_distill {
                (&hidden + &attention)?
            } else {
                match self.output_mode {
                    OutputMode::Regression => s_loss.clone(),
                    OutputMode::Classification => soft_logits.clone(),
                }
            }
        } else {
            [&s_loss, &soft_logits, &hidden, &attention]
                .into_iter()
                .try_fold(t_loss.clone(), |acc, term| acc.add(term))?
        };

        let breakdown = LossBreakdown {
            t_loss: scalar(&t_loss)?,
            s_loss: scalar(&s_loss)?,
            soft_logits: scalar(&soft_logits)?,
            hidden: scalar(&hidden)?,
            attention: scalar(&attention)?,
            total: scalar(&total)?,
        };
        self.log(
            BTreeMap::from([
                ("t_discriminator_loss".to_string(), breakdown.t_loss),
                ("s_discriminator_loss".to_string(), breakdown.s_loss),
                ("soft_logits_loss".to_string(), breakdown.soft_logits),
                ("hidden_layers_loss".to_string(), breakdown.hidden),
                ("attention_loss".to_string(), breakdown.attention),
                ("total_loss".to_string(), breakdown.total),
                ("lr".to_string(), ctx.lr),
            ]),
            ctx.global_step,
        );
        debug!(
            step = ctx.global_step,
            t_loss = breakdown.t_loss,
            s_loss = breakdown.s_loss,
            soft_logits = breakdown.soft_logits,
            hidden = breakdown.hidden,
            attention = breakdown.attention,
            total = breakdown.total,
            "Distillation losses"
        );

        Ok((total, breakdown))
    }

    fn log(&mut self, values: BTreeMap<String, f64>, step: usize) {
        if let Err(e) = self.writer.add_scalars(SCALAR_GROUP, &values, step) {
            warn!(error = %e, step, "Failed to write scalar group");
        }
    }

    fn soft_logits_loss(&self, s_logits: &Tensor, t_logits: &Tensor) -> DistillResult<Tensor> {
        let t = self.weights.temperature;
        let p = sigmoid(&(s_logits / t)?)?;
        let target = sigmoid(&(t_logits.detach() / t)?)?;
        Ok((binary_cross_entropy(&p, &target)? * (t * t))?)
    }

    /// Teacher heads are split into contiguous groups of `s_heads`; student
    /// head `i` imitates the mean of group `i`. Terms are added onto `total`.
    fn attention_loss(
        &self,
        mut total: Tensor,
        s_attens: &[Tensor],
        t_attens: &[Tensor],
        n_layers: usize,
    ) -> DistillResult<Tensor> {
        for (s_atten, t_atten) in s_attens.iter().zip(t_attens).take(n_layers) {
            let t_atten = t_atten.detach();
            for i in 0..self.head_groups {
                let group = t_atten.narrow(1, i * self.s_heads, self.s_heads)?.mean(1)?;
                let head = s_atten.narrow(1, i, 1)?.squeeze(1)?;
                total = total.add(&candle_nn::loss::mse(&head, &group)?)?;
            }
        }
        Ok(total)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Adds the per-layer MSE terms onto `total`.
fn hidden_layers_loss(
    mut total: Tensor,
    s2t_hidden: &[Tensor],
    t_hidden: &[Tensor],
    n_layers: usize,
) -> DistillResult<Tensor> {
    for (s, t) in s2t_hidden.iter().zip(t_hidden).take(n_layers) {
        total = total.add(&candle_nn::loss::mse(s, &t.detach())?)?;
    }
    Ok(total)
}

fn sigmoid(xs: &Tensor) -> candle_core::Result<Tensor> {
    (xs.neg()?.exp()? + 1.0)?.recip()
}

/// Mean binary cross-entropy between probabilities `p` and targets `y`.
fn binary_cross_entropy(p: &Tensor, y: &Tensor) -> candle_core::Result<Tensor> {
    let log_p = p.log()?.maximum(LOG_FLOOR)?;
    let log_1mp = p.affine(-1.0, 1.0)?.log()?.maximum(LOG_FLOOR)?;
    let pos = y.mul(&log_p)?;
    let neg = y.affine(-1.0, 1.0)?.mul(&log_1mp)?;
    pos.add(&neg)?.neg()?.mean_all()
}

fn scalar(t: &Tensor) -> DistillResult<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
