use super::error::DecodingError;
use crate::decoding::Token;
use serde::{Deserialize, Serialize};

/// Default weight of the amateur distribution.
pub const DEFAULT_WEIGHT: f32 = 0.5;
/// Default generation budget, in tokens.
pub const DEFAULT_MAX_TOKENS: usize = 1000;
/// Default floor every contrast value is clamped to.
pub const DEFAULT_MIN_PROBABILITY_FLOOR: f32 = 1e-9;

/// Model-side defaults read from a Hugging Face `generation_config.json`.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub eos_token_ids: Vec<u64>,
    pub bos_token_id: Option<u64>,
}

impl GenerationConfig {
    /// First end-of-sequence token, if the model declares one.
    pub fn primary_eos(&self) -> Option<Token> {
        self.eos_token_ids
            .first()
            .and_then(|&id| Token::try_from(id).ok())
    }
}

/// Validated, immutable parameters of one contrastive generation.
///
/// The only way to obtain a `DecodingConfig` is through validation, so a
/// generation can never start with an out-of-range weight or an empty budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDecodingConfig")]
pub struct DecodingConfig {
    weight: f32,
    max_tokens: usize,
    stop_token: Option<Token>,
    min_probability_floor: f32,
    concurrent_queries: bool,
}

impl DecodingConfig {
    /// Config with the given weight and budget, no stop token and the default floor.
    pub fn new(weight: f32, max_tokens: usize) -> Result<Self, DecodingError> {
        Self::builder().weight(weight).max_tokens(max_tokens).build()
    }

    pub fn builder() -> DecodingConfigBuilder {
        DecodingConfigBuilder::default()
    }

    /// Weight applied to the amateur distribution, in `[0, 1]`.
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Maximum number of tokens generated, excluding the prompt.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn stop_token(&self) -> Option<Token> {
        self.stop_token
    }

    pub fn min_probability_floor(&self) -> f32 {
        self.min_probability_floor
    }

    /// Whether the expert and amateur are queried on separate threads.
    pub fn concurrent_queries(&self) -> bool {
        self.concurrent_queries
    }

    /// A builder pre-filled with this config's values.
    pub fn to_builder(&self) -> DecodingConfigBuilder {
        DecodingConfigBuilder {
            weight: Some(self.weight),
            max_tokens: Some(self.max_tokens),
            stop_token: self.stop_token,
            min_probability_floor: Some(self.min_probability_floor),
            concurrent_queries: Some(self.concurrent_queries),
        }
    }
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            max_tokens: DEFAULT_MAX_TOKENS,
            stop_token: None,
            min_probability_floor: DEFAULT_MIN_PROBABILITY_FLOOR,
            concurrent_queries: false,
        }
    }
}

/// Builder for [`DecodingConfig`]. Unset values fall back to the defaults.
#[derive(Debug, Clone, Default)]
pub struct DecodingConfigBuilder {
    weight: Option<f32>,
    max_tokens: Option<usize>,
    stop_token: Option<Token>,
    min_probability_floor: Option<f32>,
    concurrent_queries: Option<bool>,
}

impl DecodingConfigBuilder {
    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn stop_token(mut self, token: Token) -> Self {
        self.stop_token = Some(token);
        self
    }

    pub fn without_stop_token(mut self) -> Self {
        self.stop_token = None;
        self
    }

    pub fn min_probability_floor(mut self, floor: f32) -> Self {
        self.min_probability_floor = Some(floor);
        self
    }

    /// Query the amateur on a scoped thread while the expert runs on the
    /// caller's thread. One thread is spawned per step.
    pub fn concurrent_queries(mut self, enable: bool) -> Self {
        self.concurrent_queries = Some(enable);
        self
    }

    pub fn build(self) -> Result<DecodingConfig, DecodingError> {
        let weight = self.weight.unwrap_or(DEFAULT_WEIGHT);
        if !(0.0..=1.0).contains(&weight) {
            return Err(DecodingError::invalid(
                "weight",
                format!("must be within [0, 1], got {weight}"),
            ));
        }

        let max_tokens = self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(DecodingError::invalid("max_tokens", "must be positive"));
        }

        let floor = self
            .min_probability_floor
            .unwrap_or(DEFAULT_MIN_PROBABILITY_FLOOR);
        if !floor.is_finite() || floor <= 0.0 {
            return Err(DecodingError::invalid(
                "min_probability_floor",
                format!("must be a small positive number, got {floor}"),
            ));
        }

        Ok(DecodingConfig {
            weight,
            max_tokens,
            stop_token: self.stop_token,
            min_probability_floor: floor,
            concurrent_queries: self.concurrent_queries.unwrap_or(false),
        })
    }
}

#[derive(Deserialize)]
struct RawDecodingConfig {
    #[serde(default = "default_weight", alias = "a")]
    weight: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default)]
    stop_token: Option<Token>,
    #[serde(default = "default_floor")]
    min_probability_floor: f32,
    #[serde(default)]
    concurrent_queries: bool,
}

fn default_weight() -> f32 {
    DEFAULT_WEIGHT
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_floor() -> f32 {
    DEFAULT_MIN_PROBABILITY_FLOOR
}

impl TryFrom<RawDecodingConfig> for DecodingConfig {
    type Error = DecodingError;

    fn try_from(raw: RawDecodingConfig) -> Result<Self, Self::Error> {
        let builder = DecodingConfig::builder()
            .weight(raw.weight)
            .max_tokens(raw.max_tokens)
            .min_probability_floor(raw.min_probability_floor)
            .concurrent_queries(raw.concurrent_queries);
        match raw.stop_token {
            Some(token) => builder.stop_token(token).build(),
            None => builder.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecodingConfig::builder().build().unwrap();
        assert_eq!(config, DecodingConfig::default());
        assert_eq!(config.weight(), 0.5);
        assert_eq!(config.max_tokens(), 1000);
        assert_eq!(config.stop_token(), None);
        assert!(!config.concurrent_queries());
    }

    #[test]
    fn test_weight_bounds_are_inclusive() {
        assert!(DecodingConfig::new(0.0, 1).is_ok());
        assert!(DecodingConfig::new(1.0, 1).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        for weight in [1.5, -0.1, f32::NAN, f32::INFINITY] {
            let err = DecodingConfig::new(weight, 10).unwrap_err();
            assert!(matches!(
                err,
                DecodingError::ParameterValidation {
                    parameter: "weight",
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_rejects_zero_budget() {
        let err = DecodingConfig::new(0.5, 0).unwrap_err();
        assert!(matches!(
            err,
            DecodingError::ParameterValidation {
                parameter: "max_tokens",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_bad_floor() {
        for floor in [0.0, -1e-9, f32::NAN] {
            let result = DecodingConfig::builder()
                .min_probability_floor(floor)
                .build();
            assert!(result.is_err(), "floor {floor} should be rejected");
        }
    }

    #[test]
    fn test_to_builder_round_trips() {
        let config = DecodingConfig::builder()
            .weight(0.25)
            .max_tokens(12)
            .stop_token(7)
            .build()
            .unwrap();
        let rebuilt = config.to_builder().without_stop_token().build().unwrap();
        assert_eq!(rebuilt.weight(), 0.25);
        assert_eq!(rebuilt.max_tokens(), 12);
        assert_eq!(rebuilt.stop_token(), None);
    }

    #[test]
    fn test_deserialize_validates() {
        let config: DecodingConfig =
            serde_json::from_str(r#"{"weight": 0.3, "stop_token": 151645}"#).unwrap();
        assert_eq!(config.weight(), 0.3);
        assert_eq!(config.max_tokens(), DEFAULT_MAX_TOKENS);
        assert_eq!(config.stop_token(), Some(151645));

        let invalid = serde_json::from_str::<DecodingConfig>(r#"{"weight": 1.5}"#);
        assert!(invalid.is_err());
    }

    #[test]
    fn test_primary_eos() {
        let config = GenerationConfig {
            eos_token_ids: vec![151645, 151643],
            bos_token_id: None,
        };
        assert_eq!(config.primary_eos(), Some(151645));
        assert_eq!(GenerationConfig::default().primary_eos(), None);
    }
}
