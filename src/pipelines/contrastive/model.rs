use crate::core::{Message, ModelOptions};
use crate::decoding::Token;
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

/// Minimal interface the contrastive pipeline needs from a model context.
pub trait LanguageModelContext: Send {
    /// Forward the input tokens `[batch, seq_len]` after the cached ones,
    /// returning the logits for the next token `[batch, vocab]`.
    fn generate(&mut self, input: &Tensor) -> candle_core::Result<Tensor>;

    /// Clear the internal state (KV cache and position).
    fn reset(&mut self);

    /// Number of cached tokens.
    fn position(&self) -> usize;

    fn device(&self) -> &Device;

    /// Longest sequence the model can attend over.
    fn max_seq_len(&self) -> usize;
}

#[async_trait]
pub trait TextGenerationModel: Clone + Send + Sync + 'static {
    /// Type used to configure model loading (e.g. which checkpoint size).
    type Options: ModelOptions + Clone + Send + Sync;
    /// Per-generation state returned by `new_context`.
    type Context: LanguageModelContext;

    async fn load(options: Self::Options, device: Device) -> anyhow::Result<Self>;

    fn tokenizer(&self) -> &Tokenizer;

    fn apply_chat_template(&self, messages: &[Message]) -> anyhow::Result<String>;

    /// End-of-sequence ids, most preferred first.
    fn get_eos_tokens(&self) -> Vec<Token>;

    fn get_max_seq_len(&self) -> usize;

    fn vocab_size(&self) -> usize;

    fn new_context(&self) -> Self::Context;
}
