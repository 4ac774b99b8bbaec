//! Quantized Qwen2 / Qwen2.5-Coder implementation.
//!
//! - GGUF weights shared across inference contexts behind an `Arc`
//! - Grouped query attention with q/k/v projection biases
//! - Per-context KV caching for incremental decoding
//!
//! ```rust,ignore
//! let model = Qwen2Model::from_hf(&Device::Cpu, Qwen2Size::Coder0_5B).await?;
//! let mut ctx = model.new_context();
//! let logits = ctx.generate(&input_ids)?;
//! ```

use crate::core::{ChatTemplate, GenerationConfig, Message, ModelOptions};
use crate::decoding::Token;
use crate::loaders::{GenerationConfigLoader, GgufModelLoader, TokenizerConfigLoader, TokenizerLoader};
use crate::models::components::{
    causal_mask, repeat_kv, scaled_dot_product, KvCache, Linear, QMatMul, RmsNorm,
    RotaryEmbedding,
};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Module, Result, Tensor};
use candle_nn::Embedding;
use std::io::{Read, Seek};
use std::sync::Arc;
use tokenizers::Tokenizer;

const METADATA_PREFIX: &str = "qwen2";
const END_OF_TURN: &str = "<|im_end|>";

#[derive(Debug, Clone)]
struct FeedForward {
    gate_proj: QMatMul,
    up_proj: QMatMul,
    down_proj: QMatMul,
}

impl FeedForward {
    fn load<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        prefix: &str,
        device: &Device,
    ) -> Result<Self> {
        let mut load = |name: &str| -> Result<QMatMul> {
            QMatMul::from_qtensor(content.tensor(reader, &format!("{prefix}.{name}.weight"), device)?)
        };
        Ok(Self {
            gate_proj: load("ffn_gate")?,
            up_proj: load("ffn_up")?,
            down_proj: load("ffn_down")?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rotary: Arc<RotaryEmbedding>,
}

impl Attention {
    fn forward(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let queries = self
            .q_proj
            .forward(hidden_states)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let keys = self
            .k_proj
            .forward(hidden_states)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let values = self
            .v_proj
            .forward(hidden_states)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (queries, keys) = self.rotary.apply(&queries, &keys, offset)?;
        let (keys, values) = cache.append(&keys.contiguous()?, &values.contiguous()?)?;

        let groups = self.num_heads / self.num_kv_heads;
        let keys = repeat_kv(keys, groups)?.contiguous()?;
        let values = repeat_kv(values, groups)?.contiguous()?;

        scaled_dot_product(&queries, &keys, &values, mask)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?
            .apply(&self.o_proj)
    }
}

#[derive(Debug)]
struct TransformerLayer {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl TransformerLayer {
    fn forward(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let normed = self.attention_norm.forward(hidden_states)?;
        let hidden_states = (hidden_states + self.attention.forward(&normed, mask, offset, cache)?)?;

        let normed = self.ffn_norm.forward(&hidden_states)?;
        hidden_states + self.feed_forward.forward(&normed)?
    }
}

/// Architecture hyperparameters read from GGUF metadata.
#[derive(Debug, Clone, Copy)]
struct Hyperparameters {
    num_heads: usize,
    num_kv_heads: usize,
    num_layers: usize,
    hidden_size: usize,
    max_seq_len: usize,
    rms_eps: f64,
    rope_theta: f64,
}

impl Hyperparameters {
    fn from_metadata(content: &gguf_file::Content) -> Result<Self> {
        let get = |key: &str| -> Result<&gguf_file::Value> {
            let key = format!("{METADATA_PREFIX}.{key}");
            content
                .metadata
                .get(&key)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing metadata key: {key}")))
        };

        let params = Self {
            num_heads: get("attention.head_count")?.to_u32()? as usize,
            num_kv_heads: get("attention.head_count_kv")?.to_u32()? as usize,
            num_layers: get("block_count")?.to_u32()? as usize,
            hidden_size: get("embedding_length")?.to_u32()? as usize,
            max_seq_len: get("context_length")?.to_u32()? as usize,
            rms_eps: get("attention.layer_norm_rms_epsilon")?.to_f32()? as f64,
            rope_theta: get("rope.freq_base")?.to_f32()? as f64,
        };

        if params.num_kv_heads == 0 || params.num_heads % params.num_kv_heads != 0 {
            candle_core::bail!(
                "{} attention heads cannot be grouped over {} key/value heads",
                params.num_heads,
                params.num_kv_heads
            );
        }
        Ok(params)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}

/// Model weights shared by every [`Context`] created from one model.
pub struct ModelWeights {
    embeddings: Embedding,
    layers: Vec<TransformerLayer>,
    final_norm: RmsNorm,
    output_projection: QMatMul,
    device: Device,
    max_seq_len: usize,
    vocab_size: usize,
}

impl ModelWeights {
    /// Load model weights from a GGUF file.
    pub fn from_gguf<R: Read + Seek>(
        content: gguf_file::Content,
        reader: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let params = Hyperparameters::from_metadata(&content)?;
        let head_dim = params.head_dim();

        let embedding_weights = content
            .tensor(reader, "token_embd.weight", device)?
            .dequantize(device)?;
        let vocab_size = embedding_weights.dim(0)?;
        let embeddings = Embedding::new(embedding_weights, params.hidden_size);

        let rotary = Arc::new(RotaryEmbedding::new(
            head_dim,
            params.max_seq_len,
            params.rope_theta,
            device,
        )?);

        let mut layers = Vec::with_capacity(params.num_layers);
        for i in 0..params.num_layers {
            let prefix = format!("blk.{i}");
            let attention = Attention {
                q_proj: Linear::load(&content, reader, &format!("{prefix}.attn_q"), device)?,
                k_proj: Linear::load(&content, reader, &format!("{prefix}.attn_k"), device)?,
                v_proj: Linear::load(&content, reader, &format!("{prefix}.attn_v"), device)?,
                o_proj: Linear::load(&content, reader, &format!("{prefix}.attn_output"), device)?,
                num_heads: params.num_heads,
                num_kv_heads: params.num_kv_heads,
                head_dim,
                rotary: rotary.clone(),
            };
            let feed_forward = FeedForward::load(&content, reader, &prefix, device)?;
            let attention_norm = RmsNorm::from_qtensor(
                content.tensor(reader, &format!("{prefix}.attn_norm.weight"), device)?,
                params.rms_eps,
            )?;
            let ffn_norm = RmsNorm::from_qtensor(
                content.tensor(reader, &format!("{prefix}.ffn_norm.weight"), device)?,
                params.rms_eps,
            )?;
            layers.push(TransformerLayer {
                attention,
                feed_forward,
                attention_norm,
                ffn_norm,
            });
        }

        let final_norm = RmsNorm::from_qtensor(
            content.tensor(reader, "output_norm.weight", device)?,
            params.rms_eps,
        )?;

        // Small checkpoints tie the output projection to the embeddings.
        let output_name = if content.tensor_infos.contains_key("output.weight") {
            "output.weight"
        } else {
            "token_embd.weight"
        };
        let output_projection = QMatMul::from_qtensor(content.tensor(reader, output_name, device)?)?;

        Ok(Self {
            embeddings,
            layers,
            final_norm,
            output_projection,
            device: device.clone(),
            max_seq_len: params.max_seq_len,
            vocab_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qwen2Size {
    Coder0_5B,
    Coder1_5B,
    Coder3B,
}

impl Qwen2Size {
    /// GGUF repository and file for this checkpoint.
    pub fn to_id(&self) -> (String, String) {
        let (repo, file) = match self {
            Qwen2Size::Coder0_5B => (
                "Qwen/Qwen2.5-Coder-0.5B-Instruct-GGUF",
                "qwen2.5-coder-0.5b-instruct-q4_k_m.gguf",
            ),
            Qwen2Size::Coder1_5B => (
                "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF",
                "qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
            ),
            Qwen2Size::Coder3B => (
                "Qwen/Qwen2.5-Coder-3B-Instruct-GGUF",
                "qwen2.5-coder-3b-instruct-q4_k_m.gguf",
            ),
        };
        (repo.into(), file.into())
    }

    /// Repository holding the tokenizer, generation config and chat template.
    pub fn base_repo(&self) -> &'static str {
        match self {
            Qwen2Size::Coder0_5B => "Qwen/Qwen2.5-Coder-0.5B-Instruct",
            Qwen2Size::Coder1_5B => "Qwen/Qwen2.5-Coder-1.5B-Instruct",
            Qwen2Size::Coder3B => "Qwen/Qwen2.5-Coder-3B-Instruct",
        }
    }
}

impl std::fmt::Display for Qwen2Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Qwen2Size::Coder0_5B => "qwen2.5-coder-0.5b-instruct",
            Qwen2Size::Coder1_5B => "qwen2.5-coder-1.5b-instruct",
            Qwen2Size::Coder3B => "qwen2.5-coder-3b-instruct",
        };
        write!(f, "{name}")
    }
}

impl ModelOptions for Qwen2Size {
    fn cache_key(&self) -> String {
        self.to_string()
    }
}

/// A loaded Qwen2 checkpoint with its tokenizer and chat template.
///
/// Cloning is cheap: weights, tokenizer and template are shared.
#[derive(Clone)]
pub struct Qwen2Model {
    weights: Arc<ModelWeights>,
    tokenizer: Arc<Tokenizer>,
    generation_config: GenerationConfig,
    chat_template: Arc<ChatTemplate>,
}

impl Qwen2Model {
    /// Load a checkpoint from a local GGUF file. The tokenizer, generation
    /// config and chat template are fetched from the Hub repository of `size`.
    pub async fn from_gguf<R: Read + Seek>(
        reader: &mut R,
        device: &Device,
        size: Qwen2Size,
    ) -> anyhow::Result<Self> {
        let content = gguf_file::Content::read(reader)?;
        let weights = ModelWeights::from_gguf(content, reader, device)?;
        Self::with_weights(weights, size).await
    }

    /// Download and load a checkpoint from the Hub.
    pub async fn from_hf(device: &Device, size: Qwen2Size) -> anyhow::Result<Self> {
        let (repo_id, file_name) = size.to_id();
        tracing::info!(model = %size, repo = %repo_id, "loading model weights");

        let (mut file, content) = GgufModelLoader::new(&repo_id, &file_name).load().await?;
        let weights = ModelWeights::from_gguf(content, &mut file, device)?;
        Self::with_weights(weights, size).await
    }

    async fn with_weights(weights: ModelWeights, size: Qwen2Size) -> anyhow::Result<Self> {
        let repo = size.base_repo();
        let tokenizer = TokenizerLoader::new(repo, "tokenizer.json").load().await?;
        let generation_config = GenerationConfigLoader::new(repo, "generation_config.json")
            .load()
            .await?;
        let chat_template = TokenizerConfigLoader::new(repo, "tokenizer_config.json")
            .load_chat_template()
            .await?;

        tracing::info!(
            model = %size,
            layers = weights.num_layers(),
            vocab_size = weights.vocab_size(),
            "model ready"
        );

        Ok(Self {
            weights: Arc::new(weights),
            tokenizer: Arc::new(tokenizer),
            generation_config,
            chat_template: Arc::new(chat_template),
        })
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Create a new inference context. Each context owns its KV cache and position.
    pub fn new_context(&self) -> Context {
        Context::new(self.weights.clone())
    }
}

/// A single inference context with independent state.
pub struct Context {
    weights: Arc<ModelWeights>,
    kv_caches: Vec<KvCache>,
    position: usize,
}

impl Context {
    pub fn new(weights: Arc<ModelWeights>) -> Self {
        let kv_caches = (0..weights.num_layers()).map(|_| KvCache::new()).collect();
        Self {
            weights,
            kv_caches,
            position: 0,
        }
    }

    /// Feed `input_ids` of shape `[batch, seq_len]` after the tokens already
    /// in this context and return next-token logits of shape `[batch, vocab]`.
    pub fn generate(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let offset = self.position;
        if offset + seq_len > self.weights.max_seq_len {
            candle_core::bail!(
                "context window of {} tokens exceeded ({} cached, {} new)",
                self.weights.max_seq_len,
                offset,
                seq_len
            );
        }

        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, &self.weights.device)?)
        } else {
            None
        };

        let mut hidden_states = self.weights.embeddings.forward(input_ids)?;
        for (layer, cache) in self.weights.layers.iter().zip(self.kv_caches.iter_mut()) {
            hidden_states = layer.forward(&hidden_states, mask.as_ref(), offset, cache)?;
        }
        let hidden_states = self.weights.final_norm.forward(&hidden_states)?;

        let logits = hidden_states
            .narrow(1, seq_len - 1, 1)?
            .apply(&self.weights.output_projection)?
            .squeeze(1)?;

        self.position += seq_len;
        Ok(logits)
    }

    pub fn reset(&mut self) {
        for cache in &mut self.kv_caches {
            cache.reset();
        }
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

/*

Pipeline Stuff

*/

use crate::pipelines::contrastive::model::{LanguageModelContext, TextGenerationModel};

impl LanguageModelContext for Context {
    fn generate(&mut self, input: &Tensor) -> candle_core::Result<Tensor> {
        Context::generate(self, input)
    }

    fn reset(&mut self) {
        Context::reset(self);
    }

    fn position(&self) -> usize {
        self.position
    }

    fn device(&self) -> &Device {
        &self.weights.device
    }

    fn max_seq_len(&self) -> usize {
        self.weights.max_seq_len
    }
}

#[async_trait]
impl TextGenerationModel for Qwen2Model {
    type Context = Context;
    type Options = Qwen2Size;

    async fn load(options: Self::Options, device: Device) -> anyhow::Result<Self> {
        Qwen2Model::from_hf(&device, options).await
    }

    fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn apply_chat_template(&self, messages: &[Message]) -> anyhow::Result<String> {
        self.chat_template.render(messages)
    }

    fn get_eos_tokens(&self) -> Vec<Token> {
        let mut eos: Vec<Token> = self
            .generation_config
            .eos_token_ids
            .iter()
            .filter_map(|&id| Token::try_from(id).ok())
            .collect();
        if eos.is_empty() {
            eos.extend(self.tokenizer.token_to_id(END_OF_TURN));
        }
        eos
    }

    fn get_max_seq_len(&self) -> usize {
        self.weights.max_seq_len
    }

    fn vocab_size(&self) -> usize {
        self.weights.vocab_size
    }

    fn new_context(&self) -> Context {
        Context::new(self.weights.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_repositories() {
        let (repo, file) = Qwen2Size::Coder1_5B.to_id();
        assert_eq!(repo, "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF");
        assert!(file.ends_with("q4_k_m.gguf"));
        assert_eq!(
            Qwen2Size::Coder0_5B.base_repo(),
            "Qwen/Qwen2.5-Coder-0.5B-Instruct"
        );
    }

    #[test]
    fn test_cache_keys_are_distinct() {
        let keys: std::collections::HashSet<String> = [
            Qwen2Size::Coder0_5B,
            Qwen2Size::Coder1_5B,
            Qwen2Size::Coder3B,
        ]
        .iter()
        .map(|size| size.cache_key())
        .collect();
        assert_eq!(keys.len(), 3);
    }
}
