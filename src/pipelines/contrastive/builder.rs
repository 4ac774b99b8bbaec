use super::model::TextGenerationModel;
use super::pipeline::ContrastivePipeline;
use crate::core::{global_cache, DecodingConfigBuilder, DecodingError};
use crate::decoding::Token;
use crate::models::{Qwen2Model, Qwen2Size};
use crate::pipelines::utils::{build_cache_key, DeviceRequest, DeviceSelectable};
use candle_core::Device;

#[derive(Debug, Clone, Copy)]
enum StopTokenChoice {
    /// The expert's primary end-of-sequence token.
    ModelDefault,
    Explicit(Token),
    Disabled,
}

/// Builder for [`ContrastivePipeline`].
///
/// Decoding settings are validated before any model is loaded.
pub struct ContrastivePipelineBuilder<M: TextGenerationModel> {
    expert_options: M::Options,
    amateur_options: M::Options,
    decoding: DecodingConfigBuilder,
    stop_token: StopTokenChoice,
    device_request: DeviceRequest,
}

impl<M: TextGenerationModel> ContrastivePipelineBuilder<M> {
    pub fn new(expert: M::Options, amateur: M::Options) -> Self {
        Self {
            expert_options: expert,
            amateur_options: amateur,
            decoding: DecodingConfigBuilder::default(),
            stop_token: StopTokenChoice::ModelDefault,
            device_request: DeviceRequest::Default,
        }
    }

    /// Amateur weight, in `[0, 1]`.
    pub fn weight(mut self, weight: f32) -> Self {
        self.decoding = self.decoding.weight(weight);
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.decoding = self.decoding.max_tokens(max_tokens);
        self
    }

    /// Stop on `token` instead of the model's end-of-sequence token.
    pub fn stop_token(mut self, token: Token) -> Self {
        self.stop_token = StopTokenChoice::Explicit(token);
        self
    }

    /// Always generate `max_tokens` tokens.
    pub fn without_stop_token(mut self) -> Self {
        self.stop_token = StopTokenChoice::Disabled;
        self
    }

    pub fn min_probability_floor(mut self, floor: f32) -> Self {
        self.decoding = self.decoding.min_probability_floor(floor);
        self
    }

    /// Query the two models of each step on separate threads.
    ///
    /// The amateur runs on a scoped thread spawned anew for every step, so a
    /// generation spawns up to `max_tokens` threads.
    pub fn concurrent_queries(mut self, enable: bool) -> Self {
        self.decoding = self.decoding.concurrent_queries(enable);
        self
    }

    pub async fn build(self) -> anyhow::Result<ContrastivePipeline<M>> {
        // Fail fast on invalid settings before downloading anything.
        let decoding = self.decoding.build()?;
        let device = self.device_request.resolve()?;

        let expert = load_cached::<M>(&self.expert_options, &device).await?;
        let amateur = load_cached::<M>(&self.amateur_options, &device).await?;

        if expert.vocab_size() != amateur.vocab_size() {
            return Err(DecodingError::VocabularyMismatch {
                expert: expert.vocab_size(),
                amateur: amateur.vocab_size(),
            }
            .into());
        }

        let stop_token = match self.stop_token {
            StopTokenChoice::ModelDefault => expert.get_eos_tokens().first().copied(),
            StopTokenChoice::Explicit(token) => Some(token),
            StopTokenChoice::Disabled => None,
        };
        let decoding = match stop_token {
            Some(token) => decoding.to_builder().stop_token(token).build()?,
            None => decoding,
        };

        tracing::info!(
            weight = decoding.weight(),
            max_tokens = decoding.max_tokens(),
            stop_token = ?decoding.stop_token(),
            "contrastive pipeline ready"
        );

        Ok(ContrastivePipeline::new(expert, amateur, decoding))
    }
}

async fn load_cached<M: TextGenerationModel>(
    options: &M::Options,
    device: &Device,
) -> anyhow::Result<M> {
    let key = build_cache_key(options, device);
    global_cache()
        .get_or_load(&key, || M::load(options.clone(), device.clone()))
        .await
}

impl<M: TextGenerationModel> DeviceSelectable for ContrastivePipelineBuilder<M> {
    fn device_request_mut(&mut self) -> &mut DeviceRequest {
        &mut self.device_request
    }
}

impl ContrastivePipelineBuilder<Qwen2Model> {
    pub fn qwen2_coder(expert: Qwen2Size, amateur: Qwen2Size) -> Self {
        Self::new(expert, amateur)
    }
}

impl Default for ContrastivePipelineBuilder<Qwen2Model> {
    /// Qwen2.5-Coder 1.5B as expert, 0.5B as amateur.
    fn default() -> Self {
        Self::qwen2_coder(Qwen2Size::Coder1_5B, Qwen2Size::Coder0_5B)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_weight_fails_before_loading() {
        let err = ContrastivePipelineBuilder::<Qwen2Model>::default()
            .weight(1.5)
            .cpu()
            .build()
            .await
            .err()
            .unwrap();

        match err.downcast_ref::<DecodingError>() {
            Some(DecodingError::ParameterValidation { parameter, .. }) => {
                assert_eq!(*parameter, "weight")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_max_tokens_fails_before_loading() {
        let err = ContrastivePipelineBuilder::<Qwen2Model>::default()
            .max_tokens(0)
            .cpu()
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<DecodingError>(),
            Some(DecodingError::ParameterValidation { .. })
        ));
    }
}
