use anyhow::{Context, Result};
use tracing::info;

use qdelectra_distill::GlueDataset;

use super::{setup, TrainArgs};

/// Train on `--train-data-file`, then evaluate the trained student.
pub fn run(args: &TrainArgs) -> Result<()> {
    let job = setup(&args.job)?;
    let train_data = GlueDataset::from_tsv(&args.train_data_file, job.task, &job.pipeline)
        .with_context(|| format!("Cannot load {}", args.train_data_file.display()))?;

    info!(
        task = %job.task,
        epochs = job.config.n_epochs,
        max_len = job.config.max_len,
        examples = train_data.len(),
        "Starting training"
    );

    let mut trainer = job.trainer.with_train_data(train_data);
    let stats = trainer
        .train(args.job.model_file.as_deref(), args.pretrain_file.as_deref(), args.job.data_parallel)
        .context("Training failed")?;

    info!(
        steps = stats.total_steps,
        loss = stats.final_loss,
        elapsed = format!("{:.1}s", stats.elapsed_secs),
        "Training complete"
    );

    let metrics = trainer.eval(None, args.job.data_parallel).context("Evaluation failed")?;

    println!(
        "\nTraining complete!\n\
         Steps: {}\n\
         Final loss: {:.4}\n\
         Elapsed: {:.1} s\n\
         Checkpoint: {}",
        stats.total_steps,
        stats.final_loss,
        stats.elapsed_secs,
        stats.checkpoint.display(),
    );
    super::eval::print_metrics(&metrics);
    Ok(())
}
