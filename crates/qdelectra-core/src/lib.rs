//! # qdelectra-core
//!
//! Model-side collaborators for ELECTRA distillation.
//!
//! | Module | Contents |
//! |---|---|
//! | [`electra`] | ELECTRA encoder + sequence-classification head |
//! | [`distill_electra`] | teacher/student pair with `fit_dense` alignment |
//! | [`quantized`] | int8 fake-quantized linear layers |
//! | [`parallel`] | data-parallel wrapper over replica devices |
//! | [`checkpoint`] | SafeTensors save / strict load / partial load |
//! | [`tokenizer`] | WordPiece tokenizer adapter |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod checkpoint;
pub mod device;
pub mod distill_electra;
pub mod electra;
pub mod error;
pub mod model;
pub mod parallel;
pub mod quantized;
pub mod tokenizer;

pub use device::{replica_devices, seed_device, select_device};
pub use distill_electra::{DistillElectra, DistillModelConfig};
pub use electra::{ElectraConfig, ElectraForSequenceClassification};
pub use error::{CoreError, CoreResult};
pub use model::{Batch, ClassifierOutput, DistillModel, DistillOutputs};
pub use parallel::DataParallel;
pub use quantized::QuantMode;
pub use tokenizer::{TextTokenizer, WordPieceTokenizer};
