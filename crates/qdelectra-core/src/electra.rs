//! ELECTRA discriminator for sequence classification.
//!
//! A compact BERT-family encoder that keeps what distillation needs: every
//! hidden state (embedding output plus one per layer) and every attention
//! probability tensor.  Parameter names follow the Hugging Face
//! `ElectraForSequenceClassification` layout so pretrained `model.safetensors`
//! files load without renaming.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Embedding, Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::{Batch, ClassifierOutput};
use crate::quantized::{QLinear, QuantMode};

/// Additive attention bias for padded key positions.
const MASKED_SCORE: f64 = -10_000.0;

fn default_max_position_embeddings() -> usize {
    512
}
fn default_type_vocab_size() -> usize {
    2
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}
fn default_dropout() -> f64 {
    0.1
}
fn default_num_labels() -> usize {
    2
}

/// Architecture hyper-parameters, read from a Hugging Face `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectraConfig {
    pub vocab_size: usize,
    /// Defaults to `hidden_size` when absent.
    #[serde(default)]
    pub embedding_size: Option<usize>,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
}

impl ElectraConfig {
    /// `google/electra-small-discriminator`.
    pub fn small_discriminator() -> Self {
        Self {
            vocab_size: 30522,
            embedding_size: Some(128),
            hidden_size: 256,
            num_hidden_layers: 12,
            num_attention_heads: 4,
            intermediate_size: 1024,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            num_labels: 2,
        }
    }

    /// `google/electra-base-discriminator`.
    pub fn base_discriminator() -> Self {
        Self {
            embedding_size: Some(768),
            hidden_size: 768,
            num_attention_heads: 12,
            intermediate_size: 3072,
            ..Self::small_discriminator()
        }
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size.unwrap_or(self.hidden_size)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Reject shapes the encoder cannot be built with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(CoreError::config(
                "num_attention_heads",
                format!(
                    "hidden_size {} is not divisible by {} heads",
                    self.hidden_size, self.num_attention_heads
                ),
            ));
        }
        if self.num_labels == 0 {
            return Err(CoreError::config("num_labels", "must be at least 1"));
        }
        Ok(())
    }
}

/// LayerNorm over the last axis, written with differentiable primitives.
#[derive(Debug, Clone)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

fn dropout(xs: &Tensor, p: f64, train: bool) -> candle_core::Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(xs, p as f32)
    } else {
        Ok(xs.clone())
    }
}

#[derive(Debug, Clone)]
struct Embeddings {
    word: Embedding,
    position: Embedding,
    token_type: Embedding,
    layer_norm: LayerNorm,
    dropout: f64,
}

impl Embeddings {
    fn new(cfg: &ElectraConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let size = cfg.embedding_size();
        Ok(Self {
            word: candle_nn::embedding(cfg.vocab_size, size, vb.pp("word_embeddings"))?,
            position: candle_nn::embedding(cfg.max_position_embeddings, size, vb.pp("position_embeddings"))?,
            token_type: candle_nn::embedding(cfg.type_vocab_size, size, vb.pp("token_type_embeddings"))?,
            layer_norm: LayerNorm::new(size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: cfg.hidden_dropout_prob,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;
        let xs = self
            .word
            .forward(input_ids)?
            .broadcast_add(&self.position.forward(&position_ids)?)?
            .add(&self.token_type.forward(token_type_ids)?)?;
        dropout(&self.layer_norm.forward(&xs)?, self.dropout, train)
    }
}

#[derive(Debug, Clone)]
struct SelfAttention {
    query: QLinear,
    key: QLinear,
    value: QLinear,
    output: QLinear,
    layer_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    attn_dropout: f64,
    hidden_dropout: f64,
}

impl SelfAttention {
    fn new(cfg: &ElectraConfig, mode: QuantMode, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = cfg.hidden_size;
        let sa = vb.pp("self");
        let out = vb.pp("output");
        Ok(Self {
            query: QLinear::new(h, h, mode, sa.pp("query"))?,
            key: QLinear::new(h, h, mode, sa.pp("key"))?,
            value: QLinear::new(h, h, mode, sa.pp("value"))?,
            output: QLinear::new(h, h, mode, out.pp("dense"))?,
            layer_norm: LayerNorm::new(h, cfg.layer_norm_eps, out.pp("LayerNorm"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
            attn_dropout: cfg.attention_probs_dropout_prob,
            hidden_dropout: cfg.hidden_dropout_prob,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, l, _) = xs.dims3()?;
        xs.reshape((b, l, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns the attention block output and its `[b, heads, l, l]`
    /// attention probabilities.
    fn forward(&self, hidden: &Tensor, mask_bias: &Tensor, train: bool) -> candle_core::Result<(Tensor, Tensor)> {
        let (b, l, h) = hidden.dims3()?;
        let q = self.split_heads(&self.query.forward(hidden)?)?;
        let k = self.split_heads(&self.key.forward(hidden)?)?;
        let v = self.split_heads(&self.value.forward(hidden)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let context = dropout(&probs, self.attn_dropout, train)?
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, l, h))?;
        let projected = dropout(&self.output.forward(&context)?, self.hidden_dropout, train)?;
        let out = self.layer_norm.forward(&projected.add(hidden)?)?;
        Ok((out, probs))
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    attention: SelfAttention,
    intermediate: QLinear,
    output: QLinear,
    layer_norm: LayerNorm,
    dropout: f64,
}

impl EncoderLayer {
    fn new(cfg: &ElectraConfig, mode: QuantMode, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attention: SelfAttention::new(cfg, mode, vb.pp("attention"))?,
            intermediate: QLinear::new(cfg.hidden_size, cfg.intermediate_size, mode, vb.pp("intermediate.dense"))?,
            output: QLinear::new(cfg.intermediate_size, cfg.hidden_size, mode, vb.pp("output.dense"))?,
            layer_norm: LayerNorm::new(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("output.LayerNorm"))?,
            dropout: cfg.hidden_dropout_prob,
        })
    }

    fn forward(&self, hidden: &Tensor, mask_bias: &Tensor, train: bool) -> candle_core::Result<(Tensor, Tensor)> {
        let (attended, probs) = self.attention.forward(hidden, mask_bias, train)?;
        let inter = self.intermediate.forward(&attended)?.gelu_erf()?;
        let out = dropout(&self.output.forward(&inter)?, self.dropout, train)?;
        Ok((self.layer_norm.forward(&out.add(&attended)?)?, probs))
    }
}

/// `dense → gelu → out_proj` on the first (`[CLS]`) position.
#[derive(Debug, Clone)]
struct ClassificationHead {
    dense: QLinear,
    out_proj: QLinear,
    dropout: f64,
}

impl ClassificationHead {
    fn new(cfg: &ElectraConfig, mode: QuantMode, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            dense: QLinear::new(cfg.hidden_size, cfg.hidden_size, mode, vb.pp("dense"))?,
            out_proj: QLinear::new(cfg.hidden_size, cfg.num_labels, mode, vb.pp("out_proj"))?,
            dropout: cfg.hidden_dropout_prob,
        })
    }

    fn forward(&self, sequence: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let cls = sequence.narrow(1, 0, 1)?.squeeze(1)?;
        let xs = dropout(&cls, self.dropout, train)?;
        let xs = self.dense.forward(&xs)?.gelu_erf()?;
        let xs = dropout(&xs, self.dropout, train)?;
        self.out_proj.forward(&xs)
    }
}

/// ELECTRA encoder with a sequence-classification head.
#[derive(Debug, Clone)]
pub struct ElectraForSequenceClassification {
    embeddings: Embeddings,
    embeddings_project: Option<QLinear>,
    layers: Vec<EncoderLayer>,
    classifier: ClassificationHead,
    config: ElectraConfig,
}

impl ElectraForSequenceClassification {
    /// Register (or look up) every parameter under `vb`.
    pub fn new(config: &ElectraConfig, mode: QuantMode, vb: VarBuilder) -> CoreResult<Self> {
        config.validate()?;
        let electra = vb.pp("electra");
        let embeddings = Embeddings::new(config, electra.pp("embeddings"))?;
        let embeddings_project = if config.embedding_size() != config.hidden_size {
            Some(QLinear::new(config.embedding_size(), config.hidden_size, mode, electra.pp("embeddings_project"))?)
        } else {
            None
        };
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::new(config, mode, electra.pp(format!("encoder.layer.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let classifier = ClassificationHead::new(config, mode, vb.pp("classifier"))?;

        Ok(Self { embeddings, embeddings_project, layers, classifier, config: config.clone() })
    }

    /// Hidden states, attentions, logits and task loss for `batch`.
    ///
    /// The loss is cross-entropy for `num_labels > 1` and mean-squared error
    /// against `f32` labels when `num_labels == 1`.
    pub fn forward(&self, batch: &Batch, train: bool) -> CoreResult<ClassifierOutput> {
        let mask_bias = batch
            .attention_mask
            .to_dtype(DType::F32)?
            .affine(-MASKED_SCORE, MASKED_SCORE)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        let mut hidden = self.embeddings.forward(&batch.input_ids, &batch.token_type_ids, train)?;
        if let Some(project) = &self.embeddings_project {
            hidden = project.forward(&hidden)?;
        }

        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        let mut attentions = Vec::with_capacity(self.layers.len());
        hidden_states.push(hidden.clone());
        for layer in &self.layers {
            let (next, probs) = layer.forward(&hidden, &mask_bias, train)?;
            hidden_states.push(next.clone());
            attentions.push(probs);
            hidden = next;
        }

        let logits = self.classifier.forward(&hidden, train)?;
        let loss = if self.config.num_labels == 1 {
            candle_nn::loss::mse(&logits.flatten_all()?, &batch.labels.to_dtype(DType::F32)?)?
        } else {
            candle_nn::loss::cross_entropy(&logits, &batch.labels.to_dtype(DType::U32)?)?
        };

        Ok(ClassifierOutput { loss, logits, hidden_states, attentions })
    }
}
