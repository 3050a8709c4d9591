//! # qdelectra-distill
//!
//! GLUE fine-tuning and knowledge distillation for ELECTRA discriminators.
//!
//! A teacher and a (optionally quantization-aware) student are trained
//! jointly.  Besides both task losses the student imitates the teacher's
//! soft logits, hidden states and attention maps:
//!
//! 1. [`tasks`] picks the column layout, label set and defaults of a GLUE task.
//! 2. [`pipeline`] and [`dataset`] turn TSV rows into padded [`Batch`]es.
//! 3. [`loss`] combines the five loss terms under the configured schedule
//!    (joint, gradual layer-by-layer, or TinyBERT two-stage).
//! 4. [`trainer`] runs the optimisation loop, checkpoints, and evaluates with
//!    [`metrics`].
//!
//! [`Batch`]: qdelectra_core::Batch

pub mod config;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod pipeline;
pub mod tasks;
pub mod trainer;
pub mod writer;

pub use config::{load_train_config, TrainConfig};
pub use dataset::{DataLoader, GlueDataset};
pub use error::{DistillError, DistillResult};
pub use loss::{DistillFlags, DistillLoss, LossWeights};
pub use pipeline::Pipeline;
pub use tasks::{MetricTask, OutputMode, Task};
pub use trainer::{Trainer, TrainingStats};
pub use writer::{JsonlScalarWriter, MemoryScalarWriter, ScalarWriter};
