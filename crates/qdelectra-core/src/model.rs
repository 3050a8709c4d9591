use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::CoreResult;

/// One training or evaluation batch, already padded to the task's `max_len`.
///
/// `input_ids`, `attention_mask` and `token_type_ids` are `[batch, max_len]`
/// `u32` tensors.  `labels` is `[batch]`: `u32` class indices for
/// classification tasks, `f32` scores for regression tasks.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
    pub labels: Tensor,
}

impl Batch {
    /// Number of examples in the batch.
    pub fn size(&self) -> CoreResult<usize> {
        Ok(self.input_ids.dim(0)?)
    }

    /// The examples `start..start + len` as a new batch.
    pub fn narrow(&self, start: usize, len: usize) -> CoreResult<Self> {
        Ok(Self {
            input_ids: self.input_ids.narrow(0, start, len)?,
            attention_mask: self.attention_mask.narrow(0, start, len)?,
            token_type_ids: self.token_type_ids.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
        })
    }

    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            token_type_ids: self.token_type_ids.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Output of one sequence-classification forward pass.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    /// Task loss. A scalar, or one entry per replica after a data-parallel
    /// gather.
    pub loss: Tensor,
    /// `[batch, num_labels]`.
    pub logits: Tensor,
    /// Embedding output followed by every encoder layer output, each
    /// `[batch, seq, hidden]`.
    pub hidden_states: Vec<Tensor>,
    /// Attention probabilities of every encoder layer, each
    /// `[batch, heads, seq, seq]`.
    pub attentions: Vec<Tensor>,
}

impl ClassifierOutput {
    /// Every tensor moved to `device`. The copies stay on the autograd graph.
    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        Ok(Self {
            loss: self.loss.to_device(device)?,
            logits: self.logits.to_device(device)?,
            hidden_states: move_all(&self.hidden_states, device)?,
            attentions: move_all(&self.attentions, device)?,
        })
    }

    /// Merge per-replica outputs: losses are stacked into `[replicas]`, every
    /// other tensor is concatenated along the batch axis.
    pub fn gather(parts: &[ClassifierOutput]) -> CoreResult<Self> {
        let losses: Vec<Tensor> = parts
            .iter()
            .map(|p| p.loss.flatten_all())
            .collect::<candle_core::Result<_>>()?;
        let logits: Vec<&Tensor> = parts.iter().map(|p| &p.logits).collect();

        Ok(Self {
            loss: Tensor::cat(&losses, 0)?,
            logits: Tensor::cat(&logits, 0)?,
            hidden_states: gather_layers(parts, |p| &p.hidden_states)?,
            attentions: gather_layers(parts, |p| &p.attentions)?,
        })
    }
}

fn move_all(tensors: &[Tensor], device: &Device) -> CoreResult<Vec<Tensor>> {
    Ok(tensors
        .iter()
        .map(|t| t.to_device(device))
        .collect::<candle_core::Result<Vec<_>>>()?)
}

fn gather_layers<F>(parts: &[ClassifierOutput], select: F) -> CoreResult<Vec<Tensor>>
where
    F: Fn(&ClassifierOutput) -> &Vec<Tensor>,
{
    let n_layers = parts.iter().map(|p| select(p).len()).min().unwrap_or(0);
    (0..n_layers)
        .map(|i| {
            let layer: Vec<&Tensor> = parts.iter().map(|p| &select(p)[i]).collect();
            Ok(Tensor::cat(&layer, 0)?)
        })
        .collect()
}

/// Teacher and student outputs for the same batch.
#[derive(Debug, Clone)]
pub struct DistillOutputs {
    pub teacher: ClassifierOutput,
    pub student: ClassifierOutput,
    /// Student hidden states projected to the teacher's hidden width, one per
    /// student hidden state.
    pub s2t_hidden_states: Vec<Tensor>,
}

impl DistillOutputs {
    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        Ok(Self {
            teacher: self.teacher.to_device(device)?,
            student: self.student.to_device(device)?,
            s2t_hidden_states: move_all(&self.s2t_hidden_states, device)?,
        })
    }

    pub fn gather(parts: &[DistillOutputs]) -> CoreResult<Self> {
        let teachers: Vec<ClassifierOutput> = parts.iter().map(|p| p.teacher.clone()).collect();
        let students: Vec<ClassifierOutput> = parts.iter().map(|p| p.student.clone()).collect();
        let n_layers = parts.iter().map(|p| p.s2t_hidden_states.len()).min().unwrap_or(0);
        let s2t_hidden_states = (0..n_layers)
            .map(|i| {
                let layer: Vec<&Tensor> = parts.iter().map(|p| &p.s2t_hidden_states[i]).collect();
                Ok(Tensor::cat(&layer, 0)?)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self {
            teacher: ClassifierOutput::gather(&teachers)?,
            student: ClassifierOutput::gather(&students)?,
            s2t_hidden_states,
        })
    }
}

/// A teacher/student pair that the training orchestrator can drive.
///
/// All trainable parameters (teacher, student and any alignment layers) live
/// in one [`VarMap`] so a single optimiser and a single checkpoint file cover
/// the whole pair.
pub trait DistillModel {
    /// Run teacher and student on `batch`. `train` enables dropout.
    fn forward(&self, batch: &Batch, train: bool) -> CoreResult<DistillOutputs>;

    /// Same as [`forward`](Self::forward), but on `device` with the
    /// parameters copied there. `batch` must already live on `device`.
    /// Gradients of the copies flow back into [`varmap`](Self::varmap).
    fn forward_replica(&self, device: &Device, batch: &Batch, train: bool) -> CoreResult<DistillOutputs>;

    /// Every trainable variable, keyed by tensor name.
    fn varmap(&self) -> &VarMap;

    /// Device the parameters live on.
    fn device(&self) -> &Device;
}
