//! Subcommand implementations and the job setup they share.

pub mod eval;
pub mod tasks;
pub mod train;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::{ArgAction, Args};
use tracing::info;

use qdelectra_core::{
    seed_device, select_device, DistillElectra, DistillModelConfig, TextTokenizer, WordPieceTokenizer,
};
use qdelectra_distill::{
    load_train_config, DistillFlags, DistillLoss, GlueDataset, JsonlScalarWriter, MetricTask, Pipeline, Task,
    TrainConfig, Trainer,
};

/// Options common to `train` and `eval`.
#[derive(Debug, Args)]
pub struct JobArgs {
    /// GLUE task: cola, mnli, mrpc, sst-2, sts-b, qqp, qnli, rte, wnli.
    #[arg(long, default_value = "qqp")]
    pub task: String,

    /// Base training hyper-parameters (JSON).
    #[arg(long, value_name = "FILE")]
    pub base_train_cfg: Option<PathBuf>,

    /// Task-specific overrides of the base hyper-parameters (JSON).
    #[arg(long, value_name = "FILE")]
    pub train_cfg: Option<PathBuf>,

    /// Teacher/student architecture document (JSON). Defaults to the
    /// `config.json` of `--teacher-dir`/`--student-dir`, then to an
    /// ELECTRA-base teacher with an ELECTRA-small student.
    #[arg(long, value_name = "FILE")]
    pub model_cfg: Option<PathBuf>,

    /// Held-out TSV file.
    #[arg(long, value_name = "FILE")]
    pub eval_data_file: PathBuf,

    /// Full checkpoint to restore before training / evaluation.
    #[arg(long, value_name = "FILE")]
    pub model_file: Option<PathBuf>,

    /// WordPiece vocabulary (vocab.txt).
    #[arg(long, value_name = "FILE")]
    pub vocab: PathBuf,

    /// Lowercase input text before WordPiece splitting.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub do_lower_case: bool,

    /// Directory for `scalars.jsonl`.
    #[arg(long, default_value = "runs")]
    pub log_dir: PathBuf,

    /// Directory for `model_steps_<n>.safetensors` checkpoints.
    #[arg(long, default_value = "checkpoints")]
    pub save_dir: PathBuf,

    /// Hugging Face directory with the pretrained teacher (config.json + safetensors).
    #[arg(long, value_name = "DIR", requires = "student_dir")]
    pub teacher_dir: Option<PathBuf>,

    /// Hugging Face directory with the pretrained student.
    #[arg(long, value_name = "DIR", requires = "teacher_dir")]
    pub student_dir: Option<PathBuf>,

    /// Split each batch across the available devices.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub data_parallel: bool,

    /// Add the distillation terms to the student loss.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub distill: bool,

    /// Use the int8 quantization-aware student.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub quantize: bool,

    /// Distil one more layer per epoch.
    #[arg(long)]
    pub gradually_distill: bool,

    /// Two-stage TinyBERT schedule.
    #[arg(long)]
    pub imitate_tinybert: bool,

    /// TinyBERT prediction-layer stage.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub pred_distill: bool,

    /// Prefer GPU acceleration (CUDA/Metal).
    #[arg(long)]
    pub gpu: bool,
}

#[derive(Debug, Args)]
pub struct TrainArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// Training TSV file.
    #[arg(long, value_name = "FILE")]
    pub train_data_file: PathBuf,

    /// Pretrained checkpoint to partially initialise from (matching names and shapes only).
    #[arg(long, value_name = "FILE")]
    pub pretrain_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct EvalArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// Score under another metric key, e.g. `mnli-mm`.
    #[arg(long)]
    pub metric_task: Option<String>,
}

/// Everything a subcommand needs after setup.
pub struct Job {
    pub task: Task,
    pub config: TrainConfig,
    pub pipeline: Pipeline,
    pub trainer: Trainer<DistillElectra>,
}

fn check_dirs_exist(dirs: &[&Path]) -> Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir).with_context(|| format!("Cannot create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Load configuration, tokenizer, model and loss engine, and build the
/// trainer with the held-out set attached.
pub fn setup(args: &JobArgs) -> Result<Job> {
    let task = args.task.parse::<Task>().context("Invalid --task")?;
    let spec = task.spec();

    check_dirs_exist(&[&args.log_dir, &args.save_dir])?;

    let config = load_train_config(args.base_train_cfg.as_deref(), args.train_cfg.as_deref())
        .context("Failed to load training configuration")?
        .for_task(task);
    ensure!(config.batch_size > 0, "batch_size must be at least 1");
    ensure!(
        (0.0..1.0).contains(&config.warmup),
        "warmup must be a fraction in [0, 1), got {}",
        config.warmup
    );

    let device = select_device(args.gpu, 0)?;
    seed_device(&device, config.seed);

    let mut model_cfg = resolve_model_config(args)?.with_num_labels(spec.num_labels());
    model_cfg.quantize = args.quantize;

    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(
        WordPieceTokenizer::from_vocab_file(&args.vocab, args.do_lower_case)
            .with_context(|| format!("Cannot load vocabulary {}", args.vocab.display()))?,
    );
    let pipeline = Pipeline::new(tokenizer, &spec);

    let eval_data = GlueDataset::from_tsv(&args.eval_data_file, task, &pipeline)
        .with_context(|| format!("Cannot load {}", args.eval_data_file.display()))?;

    let model = DistillElectra::new(model_cfg.clone(), &device).context("Failed to build model")?;
    if let (Some(teacher_dir), Some(student_dir)) = (&args.teacher_dir, &args.student_dir) {
        let (t, s) = model
            .load_pretrained(teacher_dir, student_dir)
            .context("Failed to load pretrained weights")?;
        info!(
            teacher_loaded = t.loaded,
            teacher_skipped = t.shape_mismatched.len(),
            student_loaded = s.loaded,
            student_skipped = s.shape_mismatched.len(),
            "Pretrained teacher and student loaded"
        );
    }

    let flags = DistillFlags {
        distill: args.distill,
        gradually_distill: args.gradually_distill,
        imitate_tinybert: args.imitate_tinybert,
        pred_distill: args.pred_distill,
    };
    let writer = JsonlScalarWriter::create(&args.log_dir)
        .with_context(|| format!("Cannot open scalar log in {}", args.log_dir.display()))?;
    info!(path = %writer.path().display(), "Writing scalar log");
    let loss = DistillLoss::new(&model_cfg, spec.output_mode, flags, config.loss_weights(), Box::new(writer))
        .context("Invalid distillation configuration")?;

    let trainer = Trainer::new(task, config.clone(), model, loss, args.save_dir.clone()).with_eval_data(eval_data);
    Ok(Job { task, config, pipeline, trainer })
}

fn resolve_model_config(args: &JobArgs) -> Result<DistillModelConfig> {
    if let Some(path) = &args.model_cfg {
        return DistillModelConfig::from_file(path)
            .with_context(|| format!("Cannot read model config {}", path.display()));
    }
    if let (Some(teacher_dir), Some(student_dir)) = (&args.teacher_dir, &args.student_dir) {
        return DistillModelConfig::from_pretrained_dirs(teacher_dir, student_dir, args.quantize)
            .context("Cannot read config.json of the pretrained models");
    }
    Ok(DistillModelConfig::default())
}

pub fn parse_metric_task(raw: Option<&str>, task: Task) -> Result<MetricTask> {
    match raw {
        Some(s) => s.parse::<MetricTask>().with_context(|| format!("Invalid --metric-task '{s}'")),
        None => Ok(task.into()),
    }
}
