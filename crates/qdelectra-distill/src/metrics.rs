//! Task-conditioned evaluation metrics.
//!
//! Predictions and labels are passed as `f64` slices: class indices for
//! classification tasks, scores for sts-b.  Mismatched lengths are a caller
//! bug and panic.

use std::collections::BTreeMap;

use crate::tasks::{MetricTask, Task};

/// Metric name → value. Ordered so log lines and JSON output are stable.
pub type Metrics = BTreeMap<String, f64>;

pub fn simple_accuracy(preds: &[f64], labels: &[f64]) -> f64 {
    assert_eq!(preds.len(), labels.len(), "predictions and labels differ in length");
    if preds.is_empty() {
        return 0.0;
    }
    let hits = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    hits as f64 / preds.len() as f64
}

/// Binary F1 with class `1` as the positive label.
pub fn f1_score(preds: &[f64], labels: &[f64]) -> f64 {
    assert_eq!(preds.len(), labels.len(), "predictions and labels differ in length");
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&p, &l) in preds.iter().zip(labels) {
        match (p == 1.0, l == 1.0) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        0.0
    } else {
        2.0 * tp as f64 / denom as f64
    }
}

pub fn acc_and_f1(preds: &[f64], labels: &[f64]) -> Metrics {
    let acc = simple_accuracy(preds, labels);
    let f1 = f1_score(preds, labels);
    Metrics::from([
        ("acc".to_string(), acc),
        ("f1".to_string(), f1),
        ("acc_and_f1".to_string(), (acc + f1) / 2.0),
    ])
}

pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    assert_eq!(xs.len(), ys.len(), "predictions and labels differ in length");
    let n = xs.len() as f64;
    if xs.is_empty() {
        return f64::NAN;
    }
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let (mut cov, mut vx, mut vy) = (0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    cov / (vx * vy).sqrt()
}

/// 1-based ranks; tied values share the mean of the ranks they span.
fn average_ranks(xs: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..xs.len()).collect();
    order.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));

    let mut ranks = vec![0.0; xs.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && xs[order[end]] == xs[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

pub fn spearman(xs: &[f64], ys: &[f64]) -> f64 {
    pearson(&average_ranks(xs), &average_ranks(ys))
}

pub fn pearson_and_spearman(preds: &[f64], labels: &[f64]) -> Metrics {
    let p = pearson(preds, labels);
    let s = spearman(preds, labels);
    Metrics::from([
        ("pearson".to_string(), p),
        ("spearmanr".to_string(), s),
        ("corr".to_string(), (p + s) / 2.0),
    ])
}

/// Matthews correlation over binary labels; 0 when any marginal is empty.
pub fn matthews_corrcoef(labels: &[f64], preds: &[f64]) -> f64 {
    assert_eq!(preds.len(), labels.len(), "predictions and labels differ in length");
    let (mut tp, mut tn, mut fp, mut fn_) = (0f64, 0f64, 0f64, 0f64);
    for (&p, &l) in preds.iter().zip(labels) {
        match (p == 1.0, l == 1.0) {
            (true, true) => tp += 1.0,
            (false, false) => tn += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
        }
    }
    let denom = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (tp * tn - fp * fn_) / denom
    }
}

pub fn compute_metrics(task: MetricTask, preds: &[f64], labels: &[f64]) -> Metrics {
    assert_eq!(preds.len(), labels.len(), "predictions and labels differ in length");
    let acc = || Metrics::from([("acc".to_string(), simple_accuracy(preds, labels))]);
    match task {
        MetricTask::Task(Task::Cola) => Metrics::from([("mcc".to_string(), matthews_corrcoef(labels, preds))]),
        MetricTask::Task(Task::Mrpc | Task::Qqp) => acc_and_f1(preds, labels),
        MetricTask::Task(Task::StsB) => pearson_and_spearman(preds, labels),
        MetricTask::Task(Task::Sst2 | Task::Mnli | Task::Qnli | Task::Rte | Task::Wnli) => acc(),
        MetricTask::MnliMismatched => acc(),
    }
}
