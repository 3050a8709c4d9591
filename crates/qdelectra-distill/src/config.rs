use std::path::Path;

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};

use crate::error::DistillResult;
use crate::loss::LossWeights;
use crate::tasks::Task;

pub const ENV_PREFIX: &str = "QDELECTRA";

/// Training hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub seed: u64,
    pub batch_size: usize,
    pub lr: f64,
    /// Fraction of the schedule spent warming up.
    pub warmup: f64,
    pub n_epochs: usize,
    pub save_steps: usize,
    /// Stop once this many optimizer steps have run. Absent or 0 disables it.
    #[serde(default)]
    pub total_steps: Option<usize>,
    pub temperature: f64,
    #[serde(rename = "lambda_")]
    pub lambda: f64,
    pub soft_logits_factor: f64,
    pub atten_layers_factor: f64,
    /// Fixed by the task registry.
    #[serde(default)]
    pub max_len: usize,
}

impl TrainConfig {
    pub fn step_budget(&self) -> Option<usize> {
        self.total_steps.filter(|&n| n > 0)
    }

    pub fn loss_weights(&self) -> LossWeights {
        LossWeights {
            temperature: self.temperature,
            lambda: self.lambda,
            soft_logits_factor: self.soft_logits_factor,
            atten_layers_factor: self.atten_layers_factor,
        }
    }

    /// Override epochs and sequence length with the task's defaults.
    pub fn for_task(mut self, task: Task) -> Self {
        let (_, n_epochs, max_len) = task.task_params();
        self.n_epochs = n_epochs;
        self.max_len = max_len;
        self
    }
}

/// Load training configuration from:
/// 1. Built-in defaults
/// 2. The base hyper-parameter file (if provided)
/// 3. The task-specific override file (if provided)
/// 4. Environment variables prefixed with `QDELECTRA_`
///
/// Files are JSON or TOML, picked by extension.
pub fn load_train_config(base: Option<&Path>, task_overrides: Option<&Path>) -> DistillResult<TrainConfig> {
    build(base, task_overrides, None)
}

fn build(
    base: Option<&Path>,
    task_overrides: Option<&Path>,
    env: Option<Map<String, String>>,
) -> DistillResult<TrainConfig> {
    let mut builder = Config::builder()
        .set_default("seed", 3431_i64)?
        .set_default("batch_size", 32_i64)?
        .set_default("lr", 5e-5)?
        .set_default("warmup", 0.1)?
        .set_default("n_epochs", 3_i64)?
        .set_default("save_steps", 1000_i64)?
        .set_default("temperature", 1.0)?
        .set_default("lambda_", 1.0)?
        .set_default("soft_logits_factor", 1.0)?
        .set_default("atten_layers_factor", 1.0)?;

    for path in [base, task_overrides].into_iter().flatten() {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true).source(env));

    Ok(builder.build()?.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env() -> Option<Map<String, String>> {
        Some(Map::new())
    }

    #[test]
    fn defaults_without_files() {
        let cfg = build(None, None, no_env()).unwrap();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.step_budget(), None);
        assert!((cfg.lambda - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn task_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.json");
        let task = dir.path().join("task.json");
        std::fs::write(&base, r#"{"seed": 1, "batch_size": 16, "lr": 1e-4, "total_steps": 0}"#).unwrap();
        std::fs::write(&task, r#"{"batch_size": 8, "lambda_": 0.5, "total_steps": 40}"#).unwrap();

        let cfg = build(Some(&base), Some(&task), no_env()).unwrap();
        assert_eq!(cfg.seed, 1);
        assert_eq!(cfg.batch_size, 8);
        assert!((cfg.lr - 1e-4).abs() < 1e-12);
        assert!((cfg.loss_weights().lambda - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.step_budget(), Some(40));
    }

    #[test]
    fn environment_wins_over_files() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.json");
        std::fs::write(&base, r#"{"save_steps": 10}"#).unwrap();
        let env = Map::from([("QDELECTRA_SAVE_STEPS".to_string(), "25".to_string())]);

        let cfg = build(Some(&base), None, Some(env)).unwrap();
        assert_eq!(cfg.save_steps, 25);
    }

    #[test]
    fn toml_documents_are_accepted() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.toml");
        std::fs::write(&base, "batch_size = 4\ntemperature = 3.0\n").unwrap();

        let cfg = build(Some(&base), None, no_env()).unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert!((cfg.temperature - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn task_defaults_override_documents() {
        let cfg = build(None, None, no_env()).unwrap().for_task(Task::Cola);
        assert_eq!((cfg.n_epochs, cfg.max_len), (50, 64));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(build(Some(Path::new("/nonexistent/base.json")), None, no_env()).is_err());
    }
}
