//! GLUE TSV loading and batching.
//!
//! Every task file is tab-separated with one header row.  Fields are split
//! on `\t` only; quotes are ordinary characters.  Each row goes through the
//! task's [`RecordExtractor`](crate::tasks::RecordExtractor) and the
//! preprocessing [`Pipeline`].

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use qdelectra_core::Batch;

use crate::error::{DistillError, DistillResult};
use crate::pipeline::{Features, Label, Pipeline};
use crate::tasks::{OutputMode, Task};

/// Preprocessed examples of one task file.
#[derive(Debug, Clone)]
pub struct GlueDataset {
    features: Vec<Features>,
    output_mode: OutputMode,
    max_len: usize,
}

impl GlueDataset {
    /// Load `path` for `task`, skipping the header row and blank lines.
    pub fn from_tsv(path: &Path, task: Task, pipeline: &Pipeline) -> DistillResult<Self> {
        let spec = task.spec();
        let extractor = spec.extractor;
        let file = fs::File::open(path).map_err(|e| {
            io::Error::new(e.kind(), format!("Cannot open {}: {e}", path.display()))
        })?;

        let mut features = Vec::new();
        for (line_no, line) in io::BufReader::new(file).lines().enumerate().skip(1) {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let record = extractor.extract(&fields).ok_or_else(|| DistillError::MalformedRow {
                path: path.to_path_buf(),
                line: line_no + 1,
                expected: extractor.min_columns(),
                found: fields.len(),
            })?;
            features.push(pipeline.process(&record)?);
        }

        info!(task = %task, path = %path.display(), examples = features.len(), "Dataset loaded");
        Ok(Self { features, output_mode: spec.output_mode, max_len: spec.max_len })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Features> {
        self.features.get(index)
    }

    /// Stack the examples at `indices` into one [`Batch`] on `device`.
    pub fn collate(&self, indices: &[usize], device: &Device) -> DistillResult<Batch> {
        let n = indices.len();
        let mut input_ids = Vec::with_capacity(n * self.max_len);
        let mut attention_mask = Vec::with_capacity(n * self.max_len);
        let mut token_type_ids = Vec::with_capacity(n * self.max_len);
        let mut class_labels = Vec::with_capacity(n);
        let mut score_labels = Vec::with_capacity(n);

        for &i in indices {
            let f = self
                .features
                .get(i)
                .ok_or_else(|| DistillError::config("batch", format!("index {i} out of range")))?;
            input_ids.extend_from_slice(&f.input_ids);
            attention_mask.extend_from_slice(&f.attention_mask);
            token_type_ids.extend_from_slice(&f.token_type_ids);
            match f.label {
                Label::Class(c) => class_labels.push(c),
                Label::Score(s) => score_labels.push(s),
            }
        }

        let labels = match self.output_mode {
            OutputMode::Classification => Tensor::from_vec(class_labels, n, device)?,
            OutputMode::Regression => Tensor::from_vec(score_labels, n, device)?,
        };
        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, (n, self.max_len), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (n, self.max_len), device)?,
            token_type_ids: Tensor::from_vec(token_type_ids, (n, self.max_len), device)?,
            labels,
        })
    }
}

/// Yields batch index lists over a [`GlueDataset`].
///
/// A shuffling loader draws a fresh permutation from its seeded RNG on every
/// call to [`DataLoader::epoch`]; a sequential loader always yields file order.
pub struct DataLoader {
    len: usize,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: &GlueDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            len: dataset.len(),
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Index lists for one pass over the dataset; the last may be short.
    pub fn epoch(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }
}
