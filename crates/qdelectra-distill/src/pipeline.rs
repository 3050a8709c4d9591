//! Record → fixed-width feature preprocessing.
//!
//! Three stages run in order on every raw record:
//!
//! 1. [`Tokenize`]: normalise and sub-word tokenize both texts and the label.
//! 2. [`AddSpecialTokensWithTruncation`]: trim the pair to the length budget
//!    and add `[CLS]` / `[SEP]`.
//! 3. [`TokenIndexing`]: look up ids, build type ids and mask, resolve the
//!    label and zero-pad to `max_len`.
//!
//! Stages hold no per-record state and are shared across a whole file.

use std::collections::HashMap;
use std::sync::Arc;

use qdelectra_core::tokenizer::{CLS_TOKEN, SEP_TOKEN};
use qdelectra_core::TextTokenizer;

use crate::error::{DistillError, DistillResult};
use crate::tasks::{OutputMode, RawRecord, TaskSpec};

/// A record between stages: label string and the two token sequences.
/// `tokens_b` is empty for single-sentence tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInstance {
    pub label: String,
    pub tokens_a: Vec<String>,
    pub tokens_b: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Label {
    Class(u32),
    Score(f32),
}

/// Terminal form of a record. All three sequences have length `max_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub label: Label,
}

/// Drop trailing tokens until `tokens_a.len() + tokens_b.len() <= max_len`.
///
/// Each step removes from `tokens_a` only when it is strictly longer, so on
/// equal lengths the second sequence is trimmed first.
pub fn truncate_tokens_pair<T>(tokens_a: &mut Vec<T>, tokens_b: &mut Vec<T>, max_len: usize) {
    while tokens_a.len() + tokens_b.len() > max_len {
        if tokens_a.len() > tokens_b.len() {
            tokens_a.pop();
        } else {
            tokens_b.pop();
        }
    }
}

pub struct Tokenize {
    tokenizer: Arc<dyn TextTokenizer>,
}

impl Tokenize {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn apply(&self, record: &RawRecord<'_>) -> DistillResult<TokenizedInstance> {
        let tokens_b = match record.text_b {
            Some(text) => self.tokenizer.tokenize(&self.tokenizer.normalize(text))?,
            None => Vec::new(),
        };
        Ok(TokenizedInstance {
            label: self.tokenizer.normalize(record.label),
            tokens_a: self.tokenizer.tokenize(&self.tokenizer.normalize(record.text_a))?,
            tokens_b,
        })
    }
}

pub struct AddSpecialTokensWithTruncation {
    max_len: usize,
}

impl AddSpecialTokensWithTruncation {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn apply(&self, mut instance: TokenizedInstance) -> TokenizedInstance {
        let has_b = !instance.tokens_b.is_empty();
        let reserved = if has_b { 3 } else { 2 };
        let budget = self.max_len.saturating_sub(reserved);
        truncate_tokens_pair(&mut instance.tokens_a, &mut instance.tokens_b, budget);

        let mut tokens_a = Vec::with_capacity(instance.tokens_a.len() + 2);
        tokens_a.push(CLS_TOKEN.to_string());
        tokens_a.append(&mut instance.tokens_a);
        tokens_a.push(SEP_TOKEN.to_string());
        instance.tokens_a = tokens_a;

        if !instance.tokens_b.is_empty() {
            instance.tokens_b.push(SEP_TOKEN.to_string());
        }
        instance
    }
}

pub struct TokenIndexing {
    tokenizer: Arc<dyn TextTokenizer>,
    label_map: HashMap<String, u32>,
    output_mode: OutputMode,
    max_len: usize,
}

impl TokenIndexing {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, labels: &[&str], output_mode: OutputMode, max_len: usize) -> Self {
        let label_map = labels
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as u32))
            .collect();
        Self { tokenizer, label_map, output_mode, max_len }
    }

    pub fn label_map(&self) -> &HashMap<String, u32> {
        &self.label_map
    }

    pub fn apply(&self, instance: &TokenizedInstance) -> DistillResult<Features> {
        let (len_a, len_b) = (instance.tokens_a.len(), instance.tokens_b.len());
        let tokens: Vec<String> = instance.tokens_a.iter().chain(&instance.tokens_b).cloned().collect();

        let mut input_ids = self.tokenizer.convert_tokens_to_ids(&tokens);
        let mut token_type_ids: Vec<u32> = std::iter::repeat(0).take(len_a).chain(std::iter::repeat(1).take(len_b)).collect();
        let mut attention_mask = vec![1u32; len_a + len_b];

        let label = match self.output_mode {
            OutputMode::Classification => {
                let id = self.label_map.get(&instance.label).ok_or_else(|| DistillError::InvalidLabel {
                    label: instance.label.clone(),
                    reason: "not in the task's label set".to_string(),
                })?;
                Label::Class(*id)
            }
            OutputMode::Regression => {
                let score = instance.label.parse::<f32>().map_err(|e| DistillError::InvalidLabel {
                    label: instance.label.clone(),
                    reason: e.to_string(),
                })?;
                Label::Score(score)
            }
        };

        for seq in [&mut input_ids, &mut token_type_ids, &mut attention_mask] {
            seq.resize(self.max_len.max(seq.len()), 0);
        }

        Ok(Features { input_ids, attention_mask, token_type_ids, label })
    }
}

/// The three stages wired for one task.
pub struct Pipeline {
    tokenize: Tokenize,
    special_tokens: AddSpecialTokensWithTruncation,
    indexing: TokenIndexing,
}

impl Pipeline {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, spec: &TaskSpec) -> Self {
        Self {
            tokenize: Tokenize::new(tokenizer.clone()),
            special_tokens: AddSpecialTokensWithTruncation::new(spec.max_len),
            indexing: TokenIndexing::new(tokenizer, spec.labels, spec.output_mode, spec.max_len),
        }
    }

    pub fn label_map(&self) -> &HashMap<String, u32> {
        self.indexing.label_map()
    }

    pub fn process(&self, record: &RawRecord<'_>) -> DistillResult<Features> {
        let instance = self.tokenize.apply(record)?;
        let instance = self.special_tokens.apply(instance);
        self.indexing.apply(&instance)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tasks::Task;
    use qdelectra_core::CoreResult;

    /// Splits on whitespace; ids are assigned on first sight after the
    /// reserved `[PAD] [UNK] [CLS] [SEP]` block.
    pub(crate) struct WhitespaceTokenizer {
        vocab: Vec<String>,
    }

    impl WhitespaceTokenizer {
        pub(crate) fn new(words: &[&str]) -> Self {
            let mut vocab: Vec<String> = ["[PAD]", "[UNK]", CLS_TOKEN, SEP_TOKEN].iter().map(|s| s.to_string()).collect();
            vocab.extend(words.iter().map(|s| s.to_string()));
            Self { vocab }
        }
    }

    impl TextTokenizer for WhitespaceTokenizer {
        fn tokenize(&self, text: &str) -> CoreResult<Vec<String>> {
            Ok(text.split_whitespace().map(str::to_lowercase).collect())
        }

        fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32> {
            tokens
                .iter()
                .map(|t| self.vocab.iter().position(|v| v == t).unwrap_or(1) as u32)
                .collect()
        }
    }

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn instance(a: &[&str], b: &[&str]) -> TokenizedInstance {
        TokenizedInstance { label: "1".into(), tokens_a: toks(a), tokens_b: toks(b) }
    }

    #[test]
    fn truncation_trims_longer_then_second() {
        let mut a = toks(&["a1", "a2", "a3", "a4"]);
        let mut b = toks(&["b1", "b2"]);
        truncate_tokens_pair(&mut a, &mut b, 4);
        assert_eq!(a, toks(&["a1", "a2"]));
        assert_eq!(b, toks(&["b1", "b2"]));

        truncate_tokens_pair(&mut a, &mut b, 3);
        assert_eq!(a, toks(&["a1", "a2"]));
        assert_eq!(b, toks(&["b1"]));
    }

    #[test]
    fn truncation_is_identity_within_budget() {
        let mut a = toks(&["x", "y"]);
        let mut b = toks(&["z"]);
        truncate_tokens_pair(&mut a, &mut b, 3);
        truncate_tokens_pair(&mut a, &mut b, 3);
        assert_eq!((a.len(), b.len()), (2, 1));
    }

    #[test]
    fn special_tokens_respect_max_len() {
        let stage = AddSpecialTokensWithTruncation::new(8);
        for (a_len, b_len) in [(0, 0), (3, 0), (10, 0), (3, 3), (10, 2), (2, 10), (6, 6)] {
            let a: Vec<&str> = vec!["a"; a_len];
            let b: Vec<&str> = vec!["b"; b_len];
            let out = stage.apply(instance(&a, &b));
            assert!(out.tokens_a.len() + out.tokens_b.len() <= 8, "{a_len}+{b_len}");
            assert_eq!(out.tokens_a.first().map(String::as_str), Some(CLS_TOKEN));
            assert_eq!(out.tokens_a.last().map(String::as_str), Some(SEP_TOKEN));
            if b_len > 0 {
                assert_eq!(out.tokens_b.last().map(String::as_str), Some(SEP_TOKEN));
            } else {
                assert!(out.tokens_b.is_empty());
            }
        }
    }

    #[test]
    fn indexing_pads_to_max_len() {
        let tok = Arc::new(WhitespaceTokenizer::new(&["hello", "world"]));
        let stage = TokenIndexing::new(tok, &["0", "1"], OutputMode::Classification, 8);
        let features = stage
            .apply(&instance(&["[CLS]", "hello", "[SEP]"], &["world", "[SEP]"]))
            .unwrap();

        assert_eq!(features.input_ids, vec![2, 4, 3, 5, 3, 0, 0, 0]);
        assert_eq!(features.token_type_ids, vec![0, 0, 0, 1, 1, 0, 0, 0]);
        assert_eq!(features.attention_mask, vec![1, 1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(features.label, Label::Class(1));
    }

    #[test]
    fn bad_labels_are_config_errors() {
        let tok: Arc<dyn TextTokenizer> = Arc::new(WhitespaceTokenizer::new(&[]));
        let cls = TokenIndexing::new(tok.clone(), &["0", "1"], OutputMode::Classification, 4);
        let mut inst = instance(&["[CLS]", "[SEP]"], &[]);
        inst.label = "2".into();
        assert!(matches!(cls.apply(&inst), Err(DistillError::InvalidLabel { label, .. }) if label == "2"));

        let reg = TokenIndexing::new(tok, &[], OutputMode::Regression, 4);
        inst.label = "n/a".into();
        assert!(matches!(reg.apply(&inst), Err(DistillError::InvalidLabel { .. })));
        inst.label = "3.25".into();
        assert_eq!(reg.apply(&inst).unwrap().label, Label::Score(3.25));
    }

    #[test]
    fn full_pipeline_on_single_sentence_task() {
        let tok = Arc::new(WhitespaceTokenizer::new(&["a", "fine", "film"]));
        let spec = Task::Sst2.spec();
        let pipeline = Pipeline::new(tok, &spec);
        let record = RawRecord { label: " 1 ", text_a: "A fine film", text_b: None };
        let features = pipeline.process(&record).unwrap();

        assert_eq!(features.input_ids.len(), spec.max_len);
        assert_eq!(features.token_type_ids.len(), spec.max_len);
        assert_eq!(features.attention_mask.len(), spec.max_len);
        assert_eq!(&features.input_ids[..5], &[2, 4, 5, 6, 3]);
        assert_eq!(features.attention_mask.iter().sum::<u32>(), 5);
        assert_eq!(features.label, Label::Class(pipeline.label_map()["1"]));
    }
}
