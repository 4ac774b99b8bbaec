use super::model::LanguageModelContext;
use crate::decoding::{DistributionSource, Token};
use anyhow::bail;
use candle_core::{DType, Tensor};

/// Prompt tokens are fed to the model at most this many at a time.
const CHUNK_SIZE: usize = 64;

/// Adapts a model context into a [`DistributionSource`].
///
/// The context keeps the KV cache of the sequence it processed last. When the
/// next query extends that sequence, only the new suffix is fed; any other
/// sequence resets the context and is fed from scratch.
pub struct ContextSource<C: LanguageModelContext> {
    context: C,
    processed: Vec<Token>,
}

impl<C: LanguageModelContext> ContextSource<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            processed: Vec::new(),
        }
    }

    /// Tokens whose keys and values are currently cached.
    pub fn processed(&self) -> &[Token] {
        &self.processed
    }

    pub fn into_inner(self) -> C {
        self.context
    }

    fn can_extend(&self, tokens: &[Token]) -> bool {
        !self.processed.is_empty()
            && self.context.position() == self.processed.len()
            && tokens.len() > self.processed.len()
            && tokens.starts_with(&self.processed)
    }
}

impl<C: LanguageModelContext> DistributionSource for ContextSource<C> {
    fn next_distribution(&mut self, tokens: &[Token]) -> anyhow::Result<Vec<f32>> {
        let max_seq_len = self.context.max_seq_len();
        if tokens.len() > max_seq_len {
            bail!(
                "sequence of {} tokens exceeds the context window of {max_seq_len}",
                tokens.len()
            );
        }

        let pending = if self.can_extend(tokens) {
            &tokens[self.processed.len()..]
        } else {
            self.context.reset();
            tokens
        };
        // Cleared until the feed succeeds, so a failed step never looks reusable.
        let reused = std::mem::take(&mut self.processed).len();

        let mut logits = None;
        for chunk in pending.chunks(CHUNK_SIZE) {
            let input = Tensor::new(chunk, self.context.device())?.unsqueeze(0)?;
            logits = Some(self.context.generate(&input)?);
        }
        let Some(logits) = logits else {
            bail!("cannot query a model with an empty sequence");
        };

        tracing::trace!(reused, fed = pending.len(), "model queried");
        self.processed = tokens.to_vec();

        let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
        Ok(probs.squeeze(0)?.to_vec1::<f32>()?)
    }
}
