//! Sub-word tokenization for GLUE sentences.
//!
//! The preprocessing pipeline only needs three operations from a tokenizer:
//! normalise a raw field, split it into sub-word tokens, and map tokens to
//! vocabulary ids.  [`TextTokenizer`] captures exactly that so tests can plug
//! in a whitespace tokenizer without a vocabulary file.

use std::path::Path;

use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const UNK_TOKEN: &str = "[UNK]";

/// The tokenizer surface consumed by the preprocessing pipeline.
pub trait TextTokenizer: Send + Sync {
    /// Normalise a raw TSV field before tokenization.
    fn normalize(&self, text: &str) -> String {
        text.trim().to_string()
    }

    /// Split normalised text into sub-word tokens.
    fn tokenize(&self, text: &str) -> CoreResult<Vec<String>>;

    /// Map tokens to vocabulary ids. Unknown tokens map to the `[UNK]` id.
    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32>;
}

/// BERT-style WordPiece tokenizer backed by the Hugging Face `tokenizers` crate.
///
/// Equivalent to the classic `FullTokenizer`: text cleanup, optional
/// lower-casing and accent stripping, punctuation splitting, then greedy
/// longest-match WordPiece with `##` continuation pieces.
#[derive(Debug)]
pub struct WordPieceTokenizer {
    inner: HfTokenizer,
    unk_id: u32,
}

impl WordPieceTokenizer {
    /// Build a tokenizer from a plain-text `vocab.txt` (one token per line).
    pub fn from_vocab_file(path: &Path, do_lower_case: bool) -> CoreResult<Self> {
        if !path.is_file() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("vocabulary file not found: {}", path.display()),
            )));
        }
        let path_str = path.to_str().ok_or_else(|| {
            CoreError::config("vocab", format!("non UTF-8 path: {}", path.display()))
        })?;

        let wordpiece = WordPiece::from_file(path_str)
            .unk_token(UNK_TOKEN.to_string())
            .continuing_subword_prefix("##".to_string())
            .max_input_chars_per_word(100)
            .build()
            .map_err(|e| CoreError::Tokenizer(format!("WordPiece build error: {e}")))?;

        let mut inner = HfTokenizer::new(wordpiece);
        inner.with_normalizer(Some(BertNormalizer::new(true, true, None, do_lower_case)));
        inner.with_pre_tokenizer(Some(BertPreTokenizer));

        let unk_id = inner.token_to_id(UNK_TOKEN).ok_or_else(|| {
            CoreError::config("vocab", format!("{} has no {UNK_TOKEN} entry", path.display()))
        })?;

        debug!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            do_lower_case,
            "WordPiece tokenizer loaded"
        );

        Ok(Self { inner, unk_id })
    }

    /// The size of the vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for WordPieceTokenizer {
    fn tokenize(&self, text: &str) -> CoreResult<Vec<String>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32> {
        tokens
            .iter()
            .map(|t| self.inner.token_to_id(t).unwrap_or(self.unk_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const VOCAB: &[&str] = &[
        "[PAD]", "[UNK]", "[CLS]", "[SEP]", "hello", "world", ",", "!", "un", "##aff", "##able",
    ];

    fn write_vocab(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("vocab.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        for tok in VOCAB {
            writeln!(f, "{tok}").unwrap();
        }
        path
    }

    #[test]
    fn lowercases_and_splits_punctuation() {
        let dir = TempDir::new().unwrap();
        let tok = WordPieceTokenizer::from_vocab_file(&write_vocab(&dir), true).unwrap();
        let tokens = tok.tokenize("Hello, World!").unwrap();
        assert_eq!(tokens, vec!["hello", ",", "world", "!"]);
    }

    #[test]
    fn splits_into_wordpieces() {
        let dir = TempDir::new().unwrap();
        let tok = WordPieceTokenizer::from_vocab_file(&write_vocab(&dir), true).unwrap();
        assert_eq!(tok.tokenize("unaffable").unwrap(), vec!["un", "##aff", "##able"]);
    }

    #[test]
    fn unknown_tokens_map_to_unk_id() {
        let dir = TempDir::new().unwrap();
        let tok = WordPieceTokenizer::from_vocab_file(&write_vocab(&dir), true).unwrap();
        let ids = tok.convert_tokens_to_ids(&["[CLS]".into(), "zebra".into(), "[SEP]".into()]);
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn vocab_size_matches_file() {
        let dir = TempDir::new().unwrap();
        let tok = WordPieceTokenizer::from_vocab_file(&write_vocab(&dir), true).unwrap();
        assert_eq!(tok.vocab_size(), VOCAB.len());
    }

    #[test]
    fn missing_vocab_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = WordPieceTokenizer::from_vocab_file(&dir.path().join("nope.txt"), true).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)), "expected Io error, got {err:?}");
    }

    #[test]
    fn default_normalize_trims() {
        let dir = TempDir::new().unwrap();
        let tok = WordPieceTokenizer::from_vocab_file(&write_vocab(&dir), true).unwrap();
        assert_eq!(tok.normalize("  1\n"), "1");
    }
}
