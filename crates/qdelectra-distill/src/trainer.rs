//! Training orchestrator.
//!
//! Drives the epoch/step loop over a teacher/student [`DistillModel`]:
//! composite loss → backward + AdamW step → student predictions on the same
//! batch → periodic `model_steps_<n>.safetensors` checkpoints.  Training
//! stops after the configured epochs or once the optional step budget is
//! reached.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, D};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use qdelectra_core::checkpoint::{load_full, load_partial, save_varmap};
use qdelectra_core::{replica_devices, Batch, DataParallel, DistillModel};

use crate::config::TrainConfig;
use crate::dataset::{DataLoader, GlueDataset};
use crate::error::{DistillError, DistillResult};
use crate::eval::{BatchScore, Evaluator, ScoreAccumulator};
use crate::loss::{DistillLoss, StepContext};
use crate::metrics::Metrics;
use crate::optim::{ScheduledAdamW, WarmupLinear};
use crate::tasks::{MetricTask, OutputMode, Task};

/// Running metrics are recomputed over the epoch's predictions this often.
const RUNNING_METRICS_EVERY: usize = 50;

// ── Training statistics ───────────────────────────────────────────────────────

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub total_steps: usize,
    /// Average loss of the last (possibly partial) epoch.
    pub final_loss: f32,
    pub elapsed_secs: f64,
    /// The checkpoint written when training stopped.
    pub checkpoint: PathBuf,
}

// ── Trainer ───────────────────────────────────────────────────────────────────

pub struct Trainer<M> {
    task: Task,
    metric_task: MetricTask,
    output_mode: OutputMode,
    config: TrainConfig,
    model: M,
    loss: DistillLoss,
    train_data: Option<GlueDataset>,
    eval_data: Option<GlueDataset>,
    save_dir: PathBuf,
}

impl<M: DistillModel> Trainer<M> {
    pub fn new(task: Task, config: TrainConfig, model: M, loss: DistillLoss, save_dir: PathBuf) -> Self {
        Self {
            task,
            metric_task: MetricTask::Task(task),
            output_mode: task.spec().output_mode,
            config,
            model,
            loss,
            train_data: None,
            eval_data: None,
            save_dir,
        }
    }

    pub fn with_train_data(mut self, data: GlueDataset) -> Self {
        self.train_data = Some(data);
        self
    }

    pub fn with_eval_data(mut self, data: GlueDataset) -> Self {
        self.eval_data = Some(data);
        self
    }

    /// Score evaluation under another metric key (e.g. `mnli-mm`).
    pub fn with_metric_task(mut self, metric_task: MetricTask) -> Self {
        self.metric_task = metric_task;
        self
    }

    /// Restore a full checkpoint, or partially initialise from a pretrained
    /// file. A full checkpoint takes precedence.
    pub fn load(&self, model_file: Option<&Path>, pretrain_file: Option<&Path>) -> DistillResult<()> {
        if let Some(path) = model_file {
            info!(path = %path.display(), "Loading model checkpoint");
            load_full(self.model.varmap(), path)?;
        } else if let Some(path) = pretrain_file {
            info!(path = %path.display(), "Loading pretrained weights");
            load_partial(self.model.varmap(), path, "")?;
        }
        Ok(())
    }

    pub fn save(&self, global_step: usize) -> DistillResult<PathBuf> {
        let path = self.save_dir.join(format!("model_steps_{global_step}.safetensors"));
        save_varmap(self.model.varmap(), &path)?;
        info!(path = %path.display(), global_step, "Checkpoint saved");
        Ok(path)
    }

    fn devices(&self, data_parallel: bool) -> Vec<Device> {
        if data_parallel {
            replica_devices(self.model.device())
        } else {
            vec![self.model.device().clone()]
        }
    }

    pub fn train(
        &mut self,
        model_file: Option<&Path>,
        pretrain_file: Option<&Path>,
        data_parallel: bool,
    ) -> DistillResult<TrainingStats> {
        self.load(model_file, pretrain_file)?;
        let data = self
            .train_data
            .as_ref()
            .ok_or_else(|| DistillError::config("train_data", "no training set loaded"))?;

        let parallel = DataParallel::new(&self.model, self.devices(data_parallel));
        let model: &dyn DistillModel = if data_parallel { &parallel } else { &self.model };
        let device = self.model.device().clone();

        let mut loader = DataLoader::new(data, self.config.batch_size, true, self.config.seed);
        let schedule_steps = self
            .config
            .step_budget()
            .unwrap_or(loader.num_batches() * self.config.n_epochs);
        let mut optimizer = ScheduledAdamW::new(
            self.model.varmap().all_vars(),
            WarmupLinear::new(self.config.lr, self.config.warmup, schedule_steps),
        )?;

        info!(
            task = %self.task,
            examples = data.len(),
            epochs = self.config.n_epochs,
            batch_size = self.config.batch_size,
            lr = self.config.lr,
            replicas = parallel.replicas(),
            flags = ?self.loss.flags(),
            "Training started"
        );

        let pb = progress_bar((loader.num_batches() * self.config.n_epochs) as u64, "Training");
        let start = Instant::now();
        let mut global_step = 0usize;
        let mut epoch_loss = 0.0f32;

        for epoch in 1..=self.config.n_epochs {
            let mut loss_sum = 0.0f32;
            let mut local_step = 0usize;
            let mut scores = ScoreAccumulator::new();
            let mut running = String::new();

            for indices in loader.epoch() {
                let batch = data.collate(&indices, &device)?;

                // ── Optimisation step ─────────────────────────────────────────
                let outputs = model.forward(&batch, true)?;
                let ctx = StepContext { global_step, epoch, lr: optimizer.current_lr() };
                let (loss, _) = self.loss.compute(&outputs, ctx)?;
                let loss = loss.mean_all()?;
                optimizer.backward_step(&loss)?;

                global_step += 1;
                local_step += 1;
                let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                loss_sum += loss_value;

                // ── Running metrics ───────────────────────────────────────────
                scores.push(evaluate_batch(model, &batch, self.output_mode)?);
                if (local_step - 1) % RUNNING_METRICS_EVERY == 0 {
                    running = format_metrics(&scores.metrics(self.metric_task));
                    debug!(step = global_step, examples = scores.len(), running = %running, "Running metrics");
                }

                pb.set_message(format!(
                    "epoch {epoch}/{} loss {:.3} {running}",
                    self.config.n_epochs,
                    loss_sum / local_step as f32
                ));
                pb.inc(1);

                if self.config.save_steps > 0 && global_step % self.config.save_steps == 0 {
                    self.save(global_step)?;
                }

                if let Some(budget) = self.config.step_budget() {
                    if global_step >= budget {
                        epoch_loss = loss_sum / local_step as f32;
                        pb.finish_with_message(format!("Step budget reached, loss {epoch_loss:.4}"));
                        info!(
                            epoch,
                            n_epochs = self.config.n_epochs,
                            average_loss = epoch_loss,
                            metrics = %format_metrics(&scores.metrics(self.metric_task)),
                            global_step,
                            "The total steps have been reached"
                        );
                        let path = self.save(global_step)?;
                        return Ok(TrainingStats {
                            total_steps: global_step,
                            final_loss: epoch_loss,
                            elapsed_secs: start.elapsed().as_secs_f64(),
                            checkpoint: path,
                        });
                    }
                }
            }

            epoch_loss = if local_step == 0 { 0.0 } else { loss_sum / local_step as f32 };
            info!(
                epoch,
                n_epochs = self.config.n_epochs,
                average_loss = epoch_loss,
                metrics = %format_metrics(&scores.metrics(self.metric_task)),
                "Epoch complete"
            );
        }

        pb.finish_with_message(format!("Training complete, loss {epoch_loss:.4}"));
        let checkpoint = self.save(global_step)?;

        Ok(TrainingStats {
            total_steps: global_step,
            final_loss: epoch_loss,
            elapsed_secs: start.elapsed().as_secs_f64(),
            checkpoint,
        })
    }

    /// Evaluate the student on the held-out set.
    pub fn eval(&self, model_file: Option<&Path>, data_parallel: bool) -> DistillResult<Metrics> {
        self.load(model_file, None)?;
        let data = self
            .eval_data
            .as_ref()
            .ok_or_else(|| DistillError::config("eval_data", "no evaluation set loaded"))?;

        let parallel = DataParallel::new(&self.model, self.devices(data_parallel));
        let model: &dyn DistillModel = if data_parallel { &parallel } else { &self.model };

        Evaluator::new(data, self.config.batch_size, self.model.device())
            .run(self.metric_task, |batch| evaluate_batch(model, batch, self.output_mode))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Student loss and predictions for one batch, with dropout disabled and no
/// gradient tracking.
pub fn evaluate_batch(model: &dyn DistillModel, batch: &Batch, output_mode: OutputMode) -> DistillResult<BatchScore> {
    let outputs = model.forward(batch, false)?;
    let logits = outputs.student.logits.detach();

    let (loss, preds, labels) = match output_mode {
        OutputMode::Classification => {
            let targets = batch.labels.to_dtype(DType::U32)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
            let preds = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            let labels = targets.to_vec1::<u32>()?;
            (
                loss,
                preds.into_iter().map(f64::from).collect::<Vec<_>>(),
                labels.into_iter().map(f64::from).collect::<Vec<_>>(),
            )
        }
        OutputMode::Regression => {
            let flat = logits.flatten_all()?;
            let targets = batch.labels.to_dtype(DType::F32)?;
            let loss = candle_nn::loss::mse(&flat, &targets)?;
            let preds = flat.to_vec1::<f32>()?;
            let labels = targets.to_vec1::<f32>()?;
            (
                loss,
                preds.into_iter().map(f64::from).collect::<Vec<_>>(),
                labels.into_iter().map(f64::from).collect::<Vec<_>>(),
            )
        }
    };

    Ok(BatchScore { loss: loss.to_dtype(DType::F64)?.to_scalar::<f64>()?, preds, labels })
}

fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );
    pb.set_message(label.to_string());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainConfig;
    use crate::loss::{DistillFlags, LossWeights};
    use crate::pipeline::tests::WhitespaceTokenizer;
    use crate::pipeline::Pipeline;
    use crate::writer::MemoryScalarWriter;
    use qdelectra_core::{DistillElectra, DistillModelConfig, ElectraConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    const WORDS: &[&str] = &["good", "bad", "film", "plot", "great", "awful"];

    fn tiny(hidden: usize, heads: usize) -> ElectraConfig {
        ElectraConfig {
            vocab_size: 16,
            embedding_size: None,
            hidden_size: hidden,
            num_hidden_layers: 2,
            num_attention_heads: heads,
            intermediate_size: hidden * 2,
            max_position_embeddings: 128,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            num_labels: 2,
        }
    }

    fn config(total_steps: Option<usize>, save_steps: usize) -> TrainConfig {
        TrainConfig {
            seed: 7,
            batch_size: 2,
            lr: 1e-3,
            warmup: 0.1,
            n_epochs: 2,
            save_steps,
            total_steps,
            temperature: 1.0,
            lambda: 1.0,
            soft_logits_factor: 1.0,
            atten_layers_factor: 1.0,
            max_len: 64,
        }
    }

    fn dataset(dir: &TempDir, task: Task) -> GlueDataset {
        let path = dir.path().join(format!("{task}.tsv"));
        let rows: &[&str] = match task {
            Task::StsB => &[
                "index\tgenre\tfilename\tyear\told_index\tsource1\tsource2\tsentence1\tsentence2\tscore",
                "0\tg\tf\t2012\t0\ts\ts\tgood film\tgreat film\t4.5",
                "1\tg\tf\t2012\t1\ts\ts\tbad plot\tgood film\t0.5",
                "2\tg\tf\t2012\t2\ts\ts\tawful film\tbad film\t3.8",
                "3\tg\tf\t2012\t3\ts\ts\tgreat plot\tawful plot\t1.0",
                "4\tg\tf\t2012\t4\ts\ts\tgood plot\tgood film\t2.6",
            ],
            _ => &[
                "sentence\tlabel",
                "good film\t1",
                "bad plot\t0",
                "great film\t1",
                "awful film\t0",
                "good plot\t1",
            ],
        };
        std::fs::write(&path, rows.join("\n")).unwrap();
        let pipeline = Pipeline::new(Arc::new(WhitespaceTokenizer::new(WORDS)), &task.spec());
        GlueDataset::from_tsv(&path, task, &pipeline).unwrap()
    }

    fn trainer_for(
        dir: &TempDir,
        task: Task,
        cfg: TrainConfig,
        flags: DistillFlags,
    ) -> (Trainer<DistillElectra>, MemoryScalarWriter) {
        let spec = task.spec();
        let model_cfg = DistillModelConfig { teacher: tiny(16, 4), student: tiny(8, 2), quantize: true }
            .with_num_labels(spec.num_labels());
        let writer = MemoryScalarWriter::new();
        let loss = DistillLoss::new(
            &model_cfg,
            spec.output_mode,
            flags,
            LossWeights::default(),
            Box::new(writer.clone()),
        )
        .unwrap();
        let model = DistillElectra::new(model_cfg, &Device::Cpu).unwrap();
        let data = dataset(dir, task);
        let trainer = Trainer::new(task, cfg, model, loss, dir.path().join("save"))
            .with_train_data(data.clone())
            .with_eval_data(data);
        (trainer, writer)
    }

    fn trainer(dir: &TempDir, cfg: TrainConfig, flags: DistillFlags) -> (Trainer<DistillElectra>, MemoryScalarWriter) {
        trainer_for(dir, Task::Sst2, cfg, flags)
    }

    #[test]
    fn trains_all_epochs_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let flags = DistillFlags { distill: true, ..Default::default() };
        let (mut trainer, writer) = trainer(&dir, config(None, 2), flags);

        let stats = trainer.train(None, None, true).unwrap();
        // 5 examples, batch 2 → 3 steps per epoch
        assert_eq!(stats.total_steps, 6);
        assert!(stats.final_loss.is_finite());
        for step in [2, 4, 6] {
            assert!(dir.path().join(format!("save/model_steps_{step}.safetensors")).exists());
        }
        assert_eq!(stats.checkpoint, dir.path().join("save/model_steps_6.safetensors"));

        let records = writer.records();
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| r.values.contains_key("attention_loss")));

        let metrics = trainer.eval(None, false).unwrap();
        assert!(metrics.contains_key("acc"));
        assert!(metrics.contains_key("loss"));
    }

    #[test]
    fn step_budget_stops_early() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, writer) = trainer(&dir, config(Some(4), 100), DistillFlags::default());

        let stats = trainer.train(None, None, false).unwrap();
        assert_eq!(stats.total_steps, 4);
        assert!(dir.path().join("save/model_steps_4.safetensors").exists());
        assert_eq!(writer.records().len(), 4);
        assert_eq!(writer.records()[0].values.len(), 2);
    }

    #[test]
    fn step_budget_reports_partial_epoch_average() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, writer) = trainer(&dir, config(Some(5), 100), DistillFlags::default());

        // 3 steps per epoch: the budget stops after steps 4 and 5 of epoch 2
        let stats = trainer.train(None, None, false).unwrap();
        assert_eq!(stats.total_steps, 5);
        let records = writer.records();
        let partial = (records[3].values["total_loss"] + records[4].values["total_loss"]) / 2.0;
        assert!((stats.final_loss as f64 - partial).abs() < 1e-4 * partial.abs().max(1.0));
    }

    #[test]
    fn regression_task_trains_and_scores_correlations() {
        let dir = TempDir::new().unwrap();
        let flags = DistillFlags { distill: true, ..Default::default() };
        let (mut trainer, _) = trainer_for(&dir, Task::StsB, config(Some(3), 100), flags);

        let stats = trainer.train(None, None, true).unwrap();
        assert!(stats.final_loss.is_finite());

        // 5 examples at batch size 2 leave a trailing batch of one
        let metrics = trainer.eval(None, true).unwrap();
        for key in ["pearson", "spearmanr", "corr", "loss"] {
            assert!(metrics[key].is_finite(), "{key} = {}", metrics[key]);
        }
        assert!(!metrics.contains_key("acc"));
        assert!(metrics["loss"] >= 0.0);
    }

    #[test]
    fn eval_restores_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, _) = trainer(&dir, config(Some(1), 100), DistillFlags::default());
        let stats = trainer.train(None, None, false).unwrap();
        let ckpt = stats.checkpoint;
        let before = trainer.eval(None, false).unwrap();

        let (fresh, _) = self::trainer(&dir, config(Some(1), 100), DistillFlags::default());
        let after = fresh.eval(Some(&ckpt), false).unwrap();
        assert!((before["loss"] - after["loss"]).abs() < 1e-6);
    }

    #[test]
    fn training_without_data_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let model_cfg = DistillModelConfig { teacher: tiny(16, 4), student: tiny(8, 2), quantize: false };
        let loss = DistillLoss::new(
            &model_cfg,
            OutputMode::Classification,
            DistillFlags::default(),
            LossWeights::default(),
            Box::new(MemoryScalarWriter::new()),
        )
        .unwrap();
        let model = DistillElectra::new(model_cfg, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(Task::Sst2, config(None, 1), model, loss, dir.path().to_path_buf());
        assert!(matches!(trainer.train(None, None, false), Err(DistillError::Config { .. })));
    }
}
