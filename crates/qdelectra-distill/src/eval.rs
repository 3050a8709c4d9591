use candle_core::Device;
use tracing::info;

use qdelectra_core::Batch;

use crate::dataset::{DataLoader, GlueDataset};
use crate::error::DistillResult;
use crate::metrics::{compute_metrics, Metrics};
use crate::tasks::MetricTask;
use crate::trainer::progress_bar;

/// Student predictions for one batch, next to the gold labels and the mean
/// student loss over the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchScore {
    pub loss: f64,
    pub preds: Vec<f64>,
    pub labels: Vec<f64>,
}

/// Predictions and labels gathered across batches.
///
/// Task metrics are computed once over everything pushed, never per batch:
/// correlations, F1 and MCC do not decompose into batch means. Only the loss
/// is averaged, weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct ScoreAccumulator {
    preds: Vec<f64>,
    labels: Vec<f64>,
    loss_sum: f64,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, score: BatchScore) {
        self.loss_sum += score.loss * score.preds.len() as f64;
        self.preds.extend(score.preds);
        self.labels.extend(score.labels);
    }

    /// Examples pushed so far.
    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    /// Task metrics over every example, plus the mean loss under `loss`.
    pub fn metrics(&self, metric_task: MetricTask) -> Metrics {
        let mut metrics = compute_metrics(metric_task, &self.preds, &self.labels);
        let loss = if self.is_empty() { 0.0 } else { self.loss_sum / self.len() as f64 };
        metrics.insert("loss".to_string(), loss);
        metrics
    }
}

/// Runs a per-batch scoring function over a held-out set in file order and
/// scores the collected predictions.
pub struct Evaluator<'a> {
    data: &'a GlueDataset,
    batch_size: usize,
    device: Device,
}

impl<'a> Evaluator<'a> {
    pub fn new(data: &'a GlueDataset, batch_size: usize, device: &Device) -> Self {
        Self { data, batch_size, device: device.clone() }
    }

    pub fn run<F>(&self, metric_task: MetricTask, mut score: F) -> DistillResult<Metrics>
    where
        F: FnMut(&Batch) -> DistillResult<BatchScore>,
    {
        let mut loader = DataLoader::new(self.data, self.batch_size, false, 0);
        let pb = progress_bar(loader.num_batches() as u64, "Evaluating");

        let mut scores = ScoreAccumulator::new();
        for indices in loader.epoch() {
            let batch = self.data.collate(&indices, &self.device)?;
            scores.push(score(&batch)?);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let metrics = scores.metrics(metric_task);
        info!(examples = scores.len(), metrics = ?metrics, "Evaluation complete");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::pearson_and_spearman;
    use crate::pipeline::tests::WhitespaceTokenizer;
    use crate::pipeline::Pipeline;
    use crate::tasks::Task;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sst2(dir: &TempDir) -> GlueDataset {
        let path = dir.path().join("dev.tsv");
        std::fs::write(&path, "sentence\tlabel\na\t1\nb\t1\nc\t0\n").unwrap();
        let pipeline = Pipeline::new(Arc::new(WhitespaceTokenizer::new(&["a", "b", "c"])), &Task::Sst2.spec());
        GlueDataset::from_tsv(&path, Task::Sst2, &pipeline).unwrap()
    }

    fn labels_of(batch: &Batch) -> Vec<f64> {
        batch.labels.to_dtype(candle_core::DType::F64).unwrap().to_vec1::<f64>().unwrap()
    }

    #[test]
    fn loss_is_weighted_by_batch_size() {
        let dir = TempDir::new().unwrap();
        let data = sst2(&dir);

        let mut calls = 0;
        let metrics = Evaluator::new(&data, 2, &Device::Cpu)
            .run(MetricTask::Task(Task::Sst2), |batch| {
                calls += 1;
                let labels = labels_of(batch);
                // batch of 2 costs 1.0, the trailing single example 0.0
                let loss = if labels.len() == 2 { 1.0 } else { 0.0 };
                Ok(BatchScore { loss, preds: labels.clone(), labels })
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert!((metrics["loss"] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics["acc"], 1.0);
    }

    #[test]
    fn trailing_single_example_keeps_correlations_finite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.tsv");
        let rows = [
            "index\tgenre\tfilename\tyear\told_index\tsource1\tsource2\tsentence1\tsentence2\tscore",
            "0\tg\tf\t2012\t0\ts\ts\ta\tb\t1.0",
            "1\tg\tf\t2012\t1\ts\ts\tb\tc\t3.5",
            "2\tg\tf\t2012\t2\ts\ts\tc\ta\t2.0",
        ];
        std::fs::write(&path, rows.join("\n")).unwrap();
        let pipeline = Pipeline::new(Arc::new(WhitespaceTokenizer::new(&["a", "b", "c"])), &Task::StsB.spec());
        let data = GlueDataset::from_tsv(&path, Task::StsB, &pipeline).unwrap();

        // predictions off by a position-dependent amount
        let mut offset = 0.0;
        let mut all_preds = Vec::new();
        let mut all_labels = Vec::new();
        let metrics = Evaluator::new(&data, 2, &Device::Cpu)
            .run(MetricTask::Task(Task::StsB), |batch| {
                let labels = labels_of(batch);
                let preds: Vec<f64> = labels
                    .iter()
                    .map(|l| {
                        offset += 0.25;
                        l * 2.0 - offset
                    })
                    .collect();
                all_preds.extend(preds.iter().copied());
                all_labels.extend(labels.iter().copied());
                Ok(BatchScore { loss: 0.5, preds, labels })
            })
            .unwrap();

        let expected = pearson_and_spearman(&all_preds, &all_labels);
        for key in ["pearson", "spearmanr", "corr"] {
            assert!(metrics[key].is_finite(), "{key} = {}", metrics[key]);
            assert!((metrics[key] - expected[key]).abs() < 1e-12);
        }
        assert!((metrics["loss"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn accumulator_scores_the_concatenation() {
        let mut scores = ScoreAccumulator::new();
        scores.push(BatchScore { loss: 1.0, preds: vec![1.0, 1.0], labels: vec![1.0, 0.0] });
        scores.push(BatchScore { loss: 4.0, preds: vec![0.0], labels: vec![0.0] });

        let metrics = scores.metrics(MetricTask::Task(Task::Mrpc));
        assert_eq!(scores.len(), 3);
        assert!((metrics["acc"] - 2.0 / 3.0).abs() < 1e-12);
        // tp 1, fp 1, fn 0
        assert!((metrics["f1"] - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics["loss"] - 2.0).abs() < 1e-12);
    }
}
