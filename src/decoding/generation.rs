//! The autoregressive contrastive decoding loop.
//!
//! Every step feeds the full sequence (prompt plus everything generated so
//! far) to both models, contrasts their next-token distributions and appends
//! the winner. Generation ends when the stop token is emitted or the token
//! budget is spent. Steps are strictly sequential; only the two queries
//! inside a step are independent of each other.

use super::buffer::TokenSequenceBuffer;
use super::cancellation::CancellationToken;
use super::combiner::{DistributionCombiner, Selection};
use super::Token;
use crate::core::{DecodingConfig, DecodingError, ModelRole};

/// Anything that can predict a distribution over the vocabulary for the
/// token following `tokens`.
///
/// Implementations receive the complete sequence on every call and may keep
/// internal state (such as a KV cache) to avoid recomputing the shared prefix.
/// Both sources of a generation must use the same vocabulary.
pub trait DistributionSource: Send {
    fn next_distribution(&mut self, tokens: &[Token]) -> anyhow::Result<Vec<f32>>;
}

impl<F> DistributionSource for F
where
    F: FnMut(&[Token]) -> anyhow::Result<Vec<f32>> + Send,
{
    fn next_distribution(&mut self, tokens: &[Token]) -> anyhow::Result<Vec<f32>> {
        self(tokens)
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured stop token was selected.
    StopToken,
    /// `max_tokens` tokens were generated.
    BudgetExhausted,
}

/// The tokens produced by a completed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Generated tokens, without the prompt and without the stop token.
    pub tokens: Vec<Token>,
    pub stop_reason: StopReason,
    /// Number of combination steps performed, including the one that
    /// selected the stop token.
    pub steps: usize,
    /// Steps where every contrast score sat at the floor.
    pub degenerate_steps: usize,
}

/// Outcome of a single [`Generation::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A token was generated and appended.
    Token(Token),
    /// Generation is over; no token is reported for this step.
    Finished(StopReason),
}

/// One in-progress generation.
///
/// Owns its token buffer exclusively; the model sources are borrowed for its
/// lifetime. Drive it with [`step`](Self::step) for streaming or
/// [`run`](Self::run) to completion. After a step returns an error the
/// generation must be dropped.
pub struct Generation<'a> {
    expert: &'a mut dyn DistributionSource,
    amateur: Option<&'a mut dyn DistributionSource>,
    config: DecodingConfig,
    combiner: DistributionCombiner,
    buffer: TokenSequenceBuffer,
    cancellation: Option<CancellationToken>,
    steps: usize,
    degenerate_steps: usize,
    finished: Option<StopReason>,
    span: tracing::Span,
}

impl<'a> Generation<'a> {
    /// Prepare a contrastive generation. With a zero weight the amateur would
    /// contribute nothing, so it is never queried.
    pub fn new(
        prompt_tokens: &[Token],
        expert: &'a mut dyn DistributionSource,
        amateur: &'a mut dyn DistributionSource,
        config: &DecodingConfig,
    ) -> Result<Self, DecodingError> {
        let amateur = if config.weight() > 0.0 {
            Some(amateur)
        } else {
            None
        };
        Self::with_sources(prompt_tokens, expert, amateur, config)
    }

    /// Prepare plain greedy decoding of a single model. `config` must carry a
    /// zero weight.
    pub fn greedy(
        prompt_tokens: &[Token],
        expert: &'a mut dyn DistributionSource,
        config: &DecodingConfig,
    ) -> Result<Self, DecodingError> {
        if config.weight() != 0.0 {
            return Err(DecodingError::invalid(
                "weight",
                format!(
                    "greedy decoding has no amateur model, weight must be 0, got {}",
                    config.weight()
                ),
            ));
        }
        Self::with_sources(prompt_tokens, expert, None, config)
    }

    fn with_sources(
        prompt_tokens: &[Token],
        expert: &'a mut dyn DistributionSource,
        amateur: Option<&'a mut dyn DistributionSource>,
        config: &DecodingConfig,
    ) -> Result<Self, DecodingError> {
        let buffer = TokenSequenceBuffer::new(prompt_tokens, config.max_tokens())?;
        let span = tracing::debug_span!(
            "contrastive_generate",
            prompt_len = prompt_tokens.len(),
            weight = config.weight(),
            max_tokens = config.max_tokens(),
        );

        Ok(Self {
            expert,
            amateur,
            config: config.clone(),
            combiner: DistributionCombiner::from_config(config),
            buffer,
            cancellation: None,
            steps: 0,
            degenerate_steps: 0,
            finished: None,
            span,
        })
    }

    /// Check `token` before and after the model queries of every step.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Run one decoding step.
    pub fn step(&mut self) -> Result<Step, DecodingError> {
        if let Some(reason) = self.finished {
            return Ok(Step::Finished(reason));
        }

        let span = self.span.clone();
        let _enter = span.enter();

        self.check_cancelled()?;
        let (expert, amateur) = self.query()?;
        self.check_cancelled()?;

        let selection = match &amateur {
            Some(amateur) => self.combiner.combine(&expert, amateur)?,
            None => self.combiner.greedy(&expert)?,
        };
        self.steps += 1;
        self.record(&selection);

        let token = selection.token;
        self.buffer.push(token);

        if self.config.stop_token() == Some(token) {
            tracing::debug!(steps = self.steps, "stop token emitted");
            self.finished = Some(StopReason::StopToken);
            return Ok(Step::Finished(StopReason::StopToken));
        }

        if self.steps >= self.config.max_tokens() {
            tracing::debug!(steps = self.steps, "token budget exhausted");
            self.finished = Some(StopReason::BudgetExhausted);
        }

        Ok(Step::Token(token))
    }

    /// Step until the generation finishes.
    pub fn run(mut self) -> Result<GenerationResult, DecodingError> {
        loop {
            if let Step::Finished(reason) = self.step()? {
                return Ok(self.into_result(reason));
            }
        }
    }

    /// Prompt and generated tokens so far.
    pub fn sequence(&self) -> &[Token] {
        self.buffer.as_slice()
    }

    /// Generated tokens so far, including a trailing stop token if one was emitted.
    pub fn generated(&self) -> &[Token] {
        self.buffer.generated()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.finished
    }

    fn into_result(self, stop_reason: StopReason) -> GenerationResult {
        let mut tokens = self.buffer.into_generated();
        if stop_reason == StopReason::StopToken {
            tokens.pop();
        }

        GenerationResult {
            tokens,
            stop_reason,
            steps: self.steps,
            degenerate_steps: self.degenerate_steps,
        }
    }

    fn check_cancelled(&self) -> Result<(), DecodingError> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => {
                tracing::debug!(steps = self.steps, "generation cancelled");
                Err(DecodingError::Cancelled { steps: self.steps })
            }
            _ => Ok(()),
        }
    }

    fn query(&mut self) -> Result<(Vec<f32>, Option<Vec<f32>>), DecodingError> {
        let sequence = self.buffer.as_slice();
        let expert = &mut *self.expert;

        let (expert_dist, amateur_dist) = match self.amateur.as_deref_mut() {
            None => (expert.next_distribution(sequence), None),
            Some(amateur) if self.config.concurrent_queries() => {
                // One short-lived thread per step; the borrows end with the step.
                std::thread::scope(|scope| {
                    let handle = scope.spawn(move || amateur.next_distribution(sequence));
                    let expert_dist = expert.next_distribution(sequence);
                    let amateur_dist = handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    (expert_dist, Some(amateur_dist))
                })
            }
            Some(amateur) => (
                expert.next_distribution(sequence),
                Some(amateur.next_distribution(sequence)),
            ),
        };

        let expert_dist = expert_dist.map_err(|e| DecodingError::query(ModelRole::Expert, e))?;
        let amateur_dist = amateur_dist
            .transpose()
            .map_err(|e| DecodingError::query(ModelRole::Amateur, e))?;

        Ok((expert_dist, amateur_dist))
    }

    fn record(&mut self, selection: &Selection) {
        if selection.degenerate {
            if self.degenerate_steps == 0 {
                tracing::warn!(
                    step = self.steps,
                    "every contrast score is at the probability floor; \
                     falling back to the lowest token index"
                );
            }
            self.degenerate_steps += 1;
        }
        tracing::trace!(
            step = self.steps,
            token = selection.token,
            score = selection.score,
            "selected token"
        );
    }
}

/// Generate from `prompt_tokens` by contrasting `expert` with `amateur`.
pub fn generate<E, A>(
    prompt_tokens: &[Token],
    expert: &mut E,
    amateur: &mut A,
    config: &DecodingConfig,
) -> Result<GenerationResult, DecodingError>
where
    E: DistributionSource,
    A: DistributionSource,
{
    Generation::new(prompt_tokens, expert, amateur, config)?.run()
}

/// [`generate`] with a cancellation token checked once per step.
pub fn generate_with_cancellation<E, A>(
    prompt_tokens: &[Token],
    expert: &mut E,
    amateur: &mut A,
    config: &DecodingConfig,
    cancellation: &CancellationToken,
) -> Result<GenerationResult, DecodingError>
where
    E: DistributionSource,
    A: DistributionSource,
{
    Generation::new(prompt_tokens, expert, amateur, config)?
        .with_cancellation(cancellation.clone())
        .run()
}

/// Greedy decoding of `expert` alone. `config` must carry a zero weight.
pub fn greedy<E>(
    prompt_tokens: &[Token],
    expert: &mut E,
    config: &DecodingConfig,
) -> Result<GenerationResult, DecodingError>
where
    E: DistributionSource,
{
    Generation::greedy(prompt_tokens, expert, config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(dist: Vec<f32>) -> impl FnMut(&[Token]) -> anyhow::Result<Vec<f32>> + Send {
        move |_| Ok(dist.clone())
    }

    /// Puts all mass on `(last token + 1) % vocab`.
    fn counting(vocab: usize) -> impl FnMut(&[Token]) -> anyhow::Result<Vec<f32>> + Send {
        move |tokens| {
            let mut dist = vec![0.0; vocab];
            let next = (*tokens.last().unwrap() as usize + 1) % vocab;
            dist[next] = 1.0;
            Ok(dist)
        }
    }

    #[test]
    fn test_budget_exhausted() {
        let config = DecodingConfig::new(0.5, 3).unwrap();
        let result = generate(
            &[0],
            &mut counting(10),
            &mut constant(vec![0.1; 10]),
            &config,
        )
        .unwrap();

        assert_eq!(result.tokens, vec![1, 2, 3]);
        assert_eq!(result.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(result.steps, 3);
    }

    #[test]
    fn test_stop_token_is_excluded() {
        let config = DecodingConfig::builder()
            .weight(0.5)
            .max_tokens(10)
            .stop_token(3)
            .build()
            .unwrap();
        let result = generate(
            &[0],
            &mut counting(10),
            &mut constant(vec![0.1; 10]),
            &config,
        )
        .unwrap();

        assert_eq!(result.tokens, vec![1, 2]);
        assert_eq!(result.stop_reason, StopReason::StopToken);
        assert_eq!(result.steps, 3);
    }

    #[test]
    fn test_step_api_reports_tokens_then_finish() {
        let config = DecodingConfig::new(0.5, 2).unwrap();
        let mut expert = counting(4);
        let mut amateur = constant(vec![0.25; 4]);
        let mut generation = Generation::new(&[1], &mut expert, &mut amateur, &config).unwrap();

        assert_eq!(generation.step().unwrap(), Step::Token(2));
        assert_eq!(generation.step().unwrap(), Step::Token(3));
        assert_eq!(generation.sequence(), &[1, 2, 3]);
        assert_eq!(
            generation.step().unwrap(),
            Step::Finished(StopReason::BudgetExhausted)
        );
        assert_eq!(generation.steps(), 2);
    }

    #[test]
    fn test_zero_weight_skips_amateur() {
        let config = DecodingConfig::new(0.0, 2).unwrap();
        let mut amateur_calls = 0;
        let mut amateur = |_: &[Token]| -> anyhow::Result<Vec<f32>> {
            amateur_calls += 1;
            Ok(vec![1.0, 0.0])
        };

        let result = generate(&[0], &mut constant(vec![0.3, 0.7]), &mut amateur, &config).unwrap();
        assert_eq!(result.tokens, vec![1, 1]);
        assert_eq!(amateur_calls, 0);
    }

    #[test]
    fn test_greedy_requires_zero_weight() {
        let config = DecodingConfig::new(0.5, 2).unwrap();
        let err = greedy(&[0], &mut constant(vec![1.0]), &config).unwrap_err();
        assert!(matches!(
            err,
            DecodingError::ParameterValidation {
                parameter: "weight",
                ..
            }
        ));
    }

    #[test]
    fn test_concurrent_queries_match_sequential() {
        let sequential = DecodingConfig::new(0.5, 5).unwrap();
        let concurrent = sequential.to_builder().concurrent_queries(true).build().unwrap();

        let a = generate(&[0], &mut counting(7), &mut counting(7), &sequential).unwrap();
        let b = generate(&[0], &mut counting(7), &mut counting(7), &concurrent).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_steps_are_counted() {
        let config = DecodingConfig::new(1.0, 2).unwrap();
        let result = generate(
            &[5],
            &mut constant(vec![0.5, 0.5]),
            &mut constant(vec![0.5, 0.5]),
            &config,
        )
        .unwrap();

        assert_eq!(result.tokens, vec![0, 0]);
        assert_eq!(result.degenerate_steps, 2);
    }

    #[test]
    fn test_amateur_failure_is_tagged() {
        let config = DecodingConfig::new(0.5, 4).unwrap();
        let mut amateur = |_: &[Token]| -> anyhow::Result<Vec<f32>> {
            Err(anyhow::anyhow!("out of memory"))
        };

        let err = generate(&[0], &mut constant(vec![1.0]), &mut amateur, &config).unwrap_err();
        assert!(matches!(
            err,
            DecodingError::ModelQuery {
                role: ModelRole::Amateur,
                ..
            }
        ));
    }
}
