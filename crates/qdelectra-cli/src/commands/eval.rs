use anyhow::{Context, Result};

use qdelectra_distill::metrics::Metrics;

use super::{parse_metric_task, setup, EvalArgs};

pub fn run(args: &EvalArgs) -> Result<()> {
    let job = setup(&args.job)?;
    let metric_task = parse_metric_task(args.metric_task.as_deref(), job.task)?;
    let trainer = job.trainer.with_metric_task(metric_task);

    let metrics = trainer
        .eval(args.job.model_file.as_deref(), args.job.data_parallel)
        .context("Evaluation failed")?;
    print_metrics(&metrics);
    Ok(())
}

pub fn print_metrics(metrics: &Metrics) {
    println!("\nEvaluation:");
    for (name, value) in metrics {
        println!("  {name:<12} {value:.4}");
    }
}
