use super::completion_stream::{CompletionStream, IncrementalDecoder};
use super::model::TextGenerationModel;
use super::source::ContextSource;
use crate::core::{DecodingConfig, Message};
use crate::decoding::{CancellationToken, Generation, GenerationResult, Step, Token};
use tokenizers::Tokenizer;

/// Input for a completion: a raw prompt or a list of chat messages.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// A raw prompt string, sent as a single user message.
    Prompt(&'a str),
    /// A sequence of chat messages.
    Messages(&'a [Message]),
}

impl<'a> From<&'a str> for Input<'a> {
    fn from(s: &'a str) -> Self {
        Self::Prompt(s)
    }
}

impl<'a> From<&'a String> for Input<'a> {
    fn from(s: &'a String) -> Self {
        Self::Prompt(s.as_str())
    }
}

impl<'a> From<&'a [Message]> for Input<'a> {
    fn from(m: &'a [Message]) -> Self {
        Self::Messages(m)
    }
}

impl<'a> From<&'a Vec<Message>> for Input<'a> {
    fn from(v: &'a Vec<Message>) -> Self {
        Self::Messages(v.as_slice())
    }
}

/// Contrastive decoding over an expert and an amateur model.
///
/// Every call creates fresh contexts for both models, so calls are
/// independent and nothing carries over between them.
pub struct ContrastivePipeline<M: TextGenerationModel> {
    expert: M,
    amateur: M,
    config: DecodingConfig,
}

impl<M: TextGenerationModel> ContrastivePipeline<M> {
    pub(crate) fn new(expert: M, amateur: M, config: DecodingConfig) -> Self {
        Self {
            expert,
            amateur,
            config,
        }
    }

    /// Template, tokenize, generate and detokenize (skipping special tokens).
    pub async fn completion<'a>(&self, input: impl Into<Input<'a>>) -> anyhow::Result<String> {
        let prompt_tokens = self.prompt_tokens(input.into())?;
        let result = self.generate_tokens(&prompt_tokens)?;
        self.decode(&result.tokens)
    }

    /// [`completion`](Self::completion) that stops with
    /// [`DecodingError::Cancelled`](crate::core::DecodingError::Cancelled)
    /// once `cancellation` is triggered.
    pub async fn completion_with_cancellation<'a>(
        &self,
        input: impl Into<Input<'a>>,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<String> {
        let prompt_tokens = self.prompt_tokens(input.into())?;
        let (mut expert, mut amateur) = self.sources();
        let result = Generation::new(&prompt_tokens, &mut expert, &mut amateur, &self.config)?
            .with_cancellation(cancellation.clone())
            .run()?;
        self.decode(&result.tokens)
    }

    /// Run the decoding loop on already tokenized input.
    pub fn generate_tokens(&self, prompt_tokens: &[Token]) -> anyhow::Result<GenerationResult> {
        let (mut expert, mut amateur) = self.sources();
        let result = Generation::new(prompt_tokens, &mut expert, &mut amateur, &self.config)?.run()?;
        tracing::debug!(
            tokens = result.tokens.len(),
            stop_reason = ?result.stop_reason,
            degenerate_steps = result.degenerate_steps,
            "generation finished"
        );
        Ok(result)
    }

    /// Stream the completion as text deltas, one model step at a time.
    pub fn completion_stream<'a>(
        &'a self,
        input: impl Into<Input<'a>>,
    ) -> anyhow::Result<CompletionStream<'a>> {
        let prompt_tokens = self.prompt_tokens(input.into())?;

        let stream = async_stream::try_stream! {
            let (mut expert, mut amateur) = self.sources();
            let mut generation =
                Generation::new(&prompt_tokens, &mut expert, &mut amateur, &self.config)?;
            let mut decoder = IncrementalDecoder::new(self.tokenizer());

            while let Step::Token(token) = generation.step()? {
                if let Some(delta) = decoder.push(token)? {
                    yield delta;
                }
            }
            if let Some(rest) = decoder.finish()? {
                yield rest;
            }
        };

        Ok(CompletionStream::new(stream))
    }

    /// Apply the expert's chat template and tokenize.
    pub fn prompt_tokens(&self, input: Input<'_>) -> anyhow::Result<Vec<Token>> {
        let templated = match input {
            Input::Prompt(prompt) => self
                .expert
                .apply_chat_template(&[Message::user(prompt)])?,
            Input::Messages(messages) => self.expert.apply_chat_template(messages)?,
        };
        let encoding = self
            .tokenizer()
            .encode(templated, true)
            .map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Detokenize, skipping special tokens.
    pub fn decode(&self, tokens: &[Token]) -> anyhow::Result<String> {
        self.tokenizer()
            .decode(tokens, true)
            .map_err(anyhow::Error::msg)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        self.expert.tokenizer()
    }

    pub fn decoding_config(&self) -> &DecodingConfig {
        &self.config
    }

    pub fn set_decoding_config(&mut self, config: DecodingConfig) {
        self.config = config;
    }

    pub fn expert(&self) -> &M {
        &self.expert
    }

    pub fn amateur(&self) -> &M {
        &self.amateur
    }

    fn sources(&self) -> (ContextSource<M::Context>, ContextSource<M::Context>) {
        (
            ContextSource::new(self.expert.new_context()),
            ContextSource::new(self.amateur.new_context()),
        )
    }
}
