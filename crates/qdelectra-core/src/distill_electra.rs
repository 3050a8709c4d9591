//! Teacher/student ELECTRA pair.
//!
//! Both classifiers and the `fit_dense` projection that maps student hidden
//! states into the teacher's width share one [`VarMap`]:
//!
//! | Prefix | Contents |
//! |---|---|
//! | `teacher.` | full-precision ELECTRA classifier |
//! | `student.` | ELECTRA classifier, optionally int8 fake-quantized |
//! | `fit_dense.` | `student.hidden_size → teacher.hidden_size` linear |

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{collect_safetensor_paths, load_partial, read_electra_config, LoadReport};
use crate::electra::{ElectraConfig, ElectraForSequenceClassification};
use crate::device::device_name;
use crate::error::{CoreError, CoreResult};
use crate::model::{Batch, DistillModel, DistillOutputs};
use crate::quantized::QuantMode;

pub const TEACHER_PREFIX: &str = "teacher.";
pub const STUDENT_PREFIX: &str = "student.";

/// Model architecture document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillModelConfig {
    pub teacher: ElectraConfig,
    pub student: ElectraConfig,
    /// Build the quantization-aware student.
    #[serde(default)]
    pub quantize: bool,
}

impl Default for DistillModelConfig {
    /// ELECTRA-base teacher, ELECTRA-small int8 student.
    fn default() -> Self {
        Self {
            teacher: ElectraConfig::base_discriminator(),
            student: ElectraConfig::small_discriminator(),
            quantize: true,
        }
    }
}

impl DistillModelConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Read both architectures from the `config.json` of Hugging Face model
    /// directories.
    pub fn from_pretrained_dirs(teacher_dir: &Path, student_dir: &Path, quantize: bool) -> CoreResult<Self> {
        Ok(Self {
            teacher: read_electra_config(teacher_dir)?,
            student: read_electra_config(student_dir)?,
            quantize,
        })
    }

    /// Set the classifier width of both models to the task's label count.
    pub fn with_num_labels(mut self, num_labels: usize) -> Self {
        self.teacher.num_labels = num_labels;
        self.student.num_labels = num_labels;
        self
    }

    pub fn student_mode(&self) -> QuantMode {
        if self.quantize {
            QuantMode::Int8
        } else {
            QuantMode::Full
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.teacher.validate()?;
        self.student.validate()
    }
}

/// Teacher, student and `fit_dense`, built from one [`VarBuilder`].
struct Modules {
    teacher: ElectraForSequenceClassification,
    student: ElectraForSequenceClassification,
    fit_dense: Linear,
}

impl Modules {
    fn new(config: &DistillModelConfig, vb: VarBuilder) -> CoreResult<Self> {
        Ok(Self {
            teacher: ElectraForSequenceClassification::new(&config.teacher, QuantMode::Full, vb.pp("teacher"))?,
            student: ElectraForSequenceClassification::new(&config.student, config.student_mode(), vb.pp("student"))?,
            fit_dense: candle_nn::linear(config.student.hidden_size, config.teacher.hidden_size, vb.pp("fit_dense"))?,
        })
    }

    fn forward(&self, batch: &Batch, train: bool) -> CoreResult<DistillOutputs> {
        let teacher = self.teacher.forward(batch, train)?;
        let student = self.student.forward(batch, train)?;
        let s2t_hidden_states = student
            .hidden_states
            .iter()
            .map(|h| self.fit_dense.forward(h))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(DistillOutputs { teacher, student, s2t_hidden_states })
    }
}

/// Jointly trained teacher and student classifiers.
pub struct DistillElectra {
    modules: Modules,
    varmap: VarMap,
    config: DistillModelConfig,
    device: Device,
}

impl DistillElectra {
    /// Build both models with freshly initialised weights on `device`.
    pub fn new(config: DistillModelConfig, device: &Device) -> CoreResult<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let modules = Modules::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, device))?;

        info!(
            teacher_layers = config.teacher.num_hidden_layers,
            teacher_hidden = config.teacher.hidden_size,
            student_layers = config.student.num_hidden_layers,
            student_hidden = config.student.hidden_size,
            quantize = config.quantize,
            "Distillation model initialised"
        );

        Ok(Self { modules, varmap, config, device: device.clone() })
    }

    /// Overwrite teacher and student parameters from Hugging Face model
    /// directories. Tensors that do not fit (e.g. a classifier head of another
    /// width) keep their initial values.
    pub fn load_pretrained(&self, teacher_dir: &Path, student_dir: &Path) -> CoreResult<(LoadReport, LoadReport)> {
        Ok((
            self.load_side(teacher_dir, TEACHER_PREFIX)?,
            self.load_side(student_dir, STUDENT_PREFIX)?,
        ))
    }

    fn load_side(&self, dir: &Path, prefix: &str) -> CoreResult<LoadReport> {
        let mut total = LoadReport::default();
        for path in collect_safetensor_paths(dir)? {
            let report = load_partial(&self.varmap, &path, prefix)?;
            total.loaded += report.loaded;
            total.unused += report.unused;
            total.shape_mismatched.extend(report.shape_mismatched);
        }
        Ok(total)
    }

    /// Modules on `device` whose weights are `to_device` copies of the
    /// variables, so backward through them reaches the originals.
    fn replica(&self, device: &Device) -> CoreResult<Modules> {
        let tensors: HashMap<String, Tensor> = {
            let data = self.varmap.data().lock().map_err(|_| CoreError::config("varmap", "lock poisoned"))?;
            data.iter().map(|(name, var)| (name.clone(), var.as_tensor().clone())).collect()
        };
        debug!(device = device_name(device), tensors = tensors.len(), "Replicating parameters");
        Modules::new(&self.config, VarBuilder::from_tensors(tensors, DType::F32, device))
    }
}

impl DistillModel for DistillElectra {
    fn forward(&self, batch: &Batch, train: bool) -> CoreResult<DistillOutputs> {
        self.modules.forward(batch, train)
    }

    fn forward_replica(&self, device: &Device, batch: &Batch, train: bool) -> CoreResult<DistillOutputs> {
        if device.same_device(&self.device) {
            return self.forward(batch, train);
        }
        self.replica(device)?.forward(batch, train)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
