//! AdamW with a warmup-linear learning-rate schedule.

use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};

use crate::error::DistillResult;

/// Linear warmup over the first `warmup` fraction of `total_steps`, then
/// linear decay `1 - step / total_steps`, floored at 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupLinear {
    base_lr: f64,
    warmup: f64,
    total_steps: usize,
}

impl WarmupLinear {
    pub fn new(base_lr: f64, warmup: f64, total_steps: usize) -> Self {
        Self { base_lr, warmup, total_steps: total_steps.max(1) }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let progress = step as f64 / self.total_steps as f64;
        let factor = if progress < self.warmup {
            progress / self.warmup
        } else {
            1.0 - progress
        };
        self.base_lr * factor.max(0.0)
    }
}

pub struct ScheduledAdamW {
    inner: AdamW,
    schedule: WarmupLinear,
    step: usize,
}

impl ScheduledAdamW {
    pub fn new(vars: Vec<Var>, schedule: WarmupLinear) -> DistillResult<Self> {
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            eps: 1e-6,
            weight_decay: 0.01,
            ..Default::default()
        };
        Ok(Self { inner: AdamW::new(vars, params)?, schedule, step: 0 })
    }

    /// Learning rate applied by the next [`backward_step`](Self::backward_step).
    pub fn current_lr(&self) -> f64 {
        self.schedule.lr_at(self.step)
    }

    /// Backpropagate `loss` and update every variable. Gradients are
    /// recomputed from scratch on each call.
    pub fn backward_step(&mut self, loss: &Tensor) -> DistillResult<()> {
        self.inner.set_learning_rate(self.current_lr());
        self.inner.backward_step(loss)?;
        self.step += 1;
        Ok(())
    }
}
