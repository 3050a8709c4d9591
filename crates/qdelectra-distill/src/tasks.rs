//! GLUE task registry.
//!
//! Every task maps to a fixed [`TaskSpec`]: ordered label set, output mode,
//! default epoch count, maximum sequence length and the TSV columns that hold
//! the label and the text fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DistillError, DistillResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "cola")]
    Cola,
    #[serde(rename = "mnli")]
    Mnli,
    #[serde(rename = "mrpc")]
    Mrpc,
    #[serde(rename = "sst-2")]
    Sst2,
    #[serde(rename = "sts-b")]
    StsB,
    #[serde(rename = "qqp")]
    Qqp,
    #[serde(rename = "qnli")]
    Qnli,
    #[serde(rename = "rte")]
    Rte,
    #[serde(rename = "wnli")]
    Wnli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Classification,
    Regression,
}

impl OutputMode {
    pub fn parse(s: &str) -> DistillResult<Self> {
        match s {
            "classification" => Ok(Self::Classification),
            "regression" => Ok(Self::Regression),
            other => Err(DistillError::UnknownOutputMode(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Regression => "regression",
        }
    }
}

/// Where a task's fields live in a TSV row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Index(usize),
    Last,
}

impl Column {
    fn resolve(self, width: usize) -> Option<usize> {
        match self {
            Self::Index(i) if i < width => Some(i),
            Self::Index(_) => None,
            Self::Last => width.checked_sub(1),
        }
    }

    fn min_width(self) -> usize {
        match self {
            Self::Index(i) => i + 1,
            Self::Last => 1,
        }
    }
}

/// One raw example: label string and one or two texts, borrowed from the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub label: &'a str,
    pub text_a: &'a str,
    pub text_b: Option<&'a str>,
}

/// Column layout of a task's TSV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordExtractor {
    pub label: Column,
    pub text_a: Column,
    pub text_b: Option<Column>,
}

impl RecordExtractor {
    /// Fewest columns a row must have.
    pub fn min_columns(&self) -> usize {
        [Some(self.label), Some(self.text_a), self.text_b]
            .into_iter()
            .flatten()
            .map(Column::min_width)
            .max()
            .unwrap_or(1)
    }

    /// Pick the fields out of a split row, or `None` if the row is too short.
    pub fn extract<'a>(&self, fields: &[&'a str]) -> Option<RawRecord<'a>> {
        let width = fields.len();
        if width < self.min_columns() {
            return None;
        }
        let text_b = match self.text_b {
            Some(col) => Some(fields[col.resolve(width)?]),
            None => None,
        };
        Some(RawRecord {
            label: fields[self.label.resolve(width)?],
            text_a: fields[self.text_a.resolve(width)?],
            text_b,
        })
    }
}

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub labels: &'static [&'static str],
    pub output_mode: OutputMode,
    pub n_epochs: usize,
    pub max_len: usize,
    pub extractor: RecordExtractor,
}

impl TaskSpec {
    /// Classifier width: the label count, or 1 for regression.
    pub fn num_labels(&self) -> usize {
        match self.output_mode {
            OutputMode::Classification => self.labels.len(),
            OutputMode::Regression => 1,
        }
    }

    /// Index of `label` in the label set.
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| *l == label)
    }
}

const BINARY: &[&str] = &["0", "1"];
const ENTAILMENT: &[&str] = &["entailment", "not_entailment"];
const NLI: &[&str] = &["contradiction", "entailment", "neutral"];
const REGRESSION: &[&str] = &[];

const fn columns(label: Column, text_a: usize, text_b: Option<usize>) -> RecordExtractor {
    RecordExtractor {
        label,
        text_a: Column::Index(text_a),
        text_b: match text_b {
            Some(i) => Some(Column::Index(i)),
            None => None,
        },
    }
}

impl Task {
    pub const ALL: [Task; 9] = [
        Task::Cola,
        Task::Mnli,
        Task::Mrpc,
        Task::Sst2,
        Task::StsB,
        Task::Qqp,
        Task::Qnli,
        Task::Rte,
        Task::Wnli,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Task::Cola => "cola",
            Task::Mnli => "mnli",
            Task::Mrpc => "mrpc",
            Task::Sst2 => "sst-2",
            Task::StsB => "sts-b",
            Task::Qqp => "qqp",
            Task::Qnli => "qnli",
            Task::Rte => "rte",
            Task::Wnli => "wnli",
        }
    }

    pub fn spec(self) -> TaskSpec {
        use Column::{Index, Last};
        use OutputMode::{Classification, Regression};

        let (labels, output_mode, n_epochs, max_len, extractor) = match self {
            Task::Cola => (BINARY, Classification, 50, 64, columns(Index(1), 3, None)),
            Task::Mnli => (NLI, Classification, 5, 128, columns(Last, 8, Some(9))),
            Task::Mrpc => (BINARY, Classification, 20, 128, columns(Index(0), 3, Some(4))),
            Task::Sst2 => (BINARY, Classification, 10, 64, columns(Index(1), 0, None)),
            Task::StsB => (REGRESSION, Regression, 20, 128, columns(Last, 7, Some(8))),
            Task::Qqp => (BINARY, Classification, 5, 128, columns(Index(5), 3, Some(4))),
            Task::Qnli => (ENTAILMENT, Classification, 10, 128, columns(Last, 2, Some(1))),
            Task::Rte => (ENTAILMENT, Classification, 20, 128, columns(Last, 1, Some(2))),
            Task::Wnli => (BINARY, Classification, 3, 128, columns(Last, 1, Some(2))),
        };
        TaskSpec { labels, output_mode, n_epochs, max_len, extractor }
    }

    /// Record extractor for this task's TSV files.
    pub fn dataset_parser(self) -> RecordExtractor {
        self.spec().extractor
    }

    /// `(output_mode, n_epochs, max_len)`.
    pub fn task_params(self) -> (OutputMode, usize, usize) {
        let spec = self.spec();
        (spec.output_mode, spec.n_epochs, spec.max_len)
    }
}

impl FromStr for Task {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DistillError::UnknownTask(s.to_string()))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric selection key. Adds the mismatched-MNLI evaluation alias to the
/// training tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricTask {
    Task(Task),
    MnliMismatched,
}

impl FromStr for MetricTask {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "mnli-mm" {
            return Ok(Self::MnliMismatched);
        }
        s.parse().map(Self::Task)
    }
}

impl From<Task> for MetricTask {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}
