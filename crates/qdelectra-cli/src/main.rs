use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{EvalArgs, TrainArgs};

/// qdelectra: ELECTRA fine-tuning with quantization-aware knowledge distillation
#[derive(Debug, Parser)]
#[command(name = "qdelectra", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train teacher and student on a GLUE task, then evaluate the student.
    Train(TrainArgs),

    /// Evaluate a checkpoint on a held-out set.
    Eval(EvalArgs),

    /// List the supported tasks and their defaults.
    Tasks,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    match cli.command {
        Commands::Train(args) => commands::train::run(&args)?,
        Commands::Eval(args) => commands::eval::run(&args)?,
        Commands::Tasks => commands::tasks::run(),
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_flags_parse_with_defaults() {
        let cli = Cli::try_parse_from([
            "qdelectra",
            "train",
            "--task",
            "rte",
            "--train-data-file",
            "RTE/train.tsv",
            "--eval-data-file",
            "RTE/dev.tsv",
            "--vocab",
            "vocab.txt",
            "--gradually-distill",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        assert_eq!(args.job.task, "rte");
        assert!(args.job.distill);
        assert!(args.job.quantize);
        assert!(args.job.pred_distill);
        assert!(args.job.gradually_distill);
        assert!(!args.job.imitate_tinybert);
        assert!(args.job.data_parallel);
    }

    #[test]
    fn true_by_default_flags_can_be_switched_off() {
        let cli = Cli::try_parse_from([
            "qdelectra",
            "eval",
            "--eval-data-file",
            "dev.tsv",
            "--vocab",
            "vocab.txt",
            "--distill",
            "false",
            "--data-parallel",
            "false",
        ])
        .unwrap();
        let Commands::Eval(args) = cli.command else { panic!("expected eval") };
        assert!(!args.job.distill);
        assert!(!args.job.data_parallel);
    }

    #[test]
    fn teacher_dir_requires_student_dir() {
        let res = Cli::try_parse_from([
            "qdelectra",
            "eval",
            "--eval-data-file",
            "dev.tsv",
            "--vocab",
            "vocab.txt",
            "--teacher-dir",
            "electra-base",
        ]);
        assert!(res.is_err());
    }
}
