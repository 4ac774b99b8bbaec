use thiserror::Error;

/// Which of the two collaborating models a failure or distribution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// The stronger model whose distinctive behavior is amplified.
    Expert,
    /// The weaker model whose shared behavior is discounted.
    Amateur,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRole::Expert => write!(f, "expert"),
            ModelRole::Amateur => write!(f, "amateur"),
        }
    }
}

/// Errors raised by the contrastive decoding core.
#[derive(Debug, Error)]
pub enum DecodingError {
    /// A decoding parameter was out of range. Raised before any model is queried.
    #[error("invalid value for `{parameter}`: {reason}")]
    ParameterValidation {
        parameter: &'static str,
        reason: String,
    },

    /// The two models returned distributions over vocabularies of different sizes.
    #[error("vocabulary mismatch: expert distribution has {expert} entries, amateur has {amateur}")]
    VocabularyMismatch { expert: usize, amateur: usize },

    /// A model returned a distribution with no entries at all.
    #[error("model returned an empty vocabulary distribution")]
    EmptyVocabulary,

    /// A model query failed. The underlying error is passed through untouched.
    #[error("{role} model query failed")]
    ModelQuery {
        role: ModelRole,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Generation was cancelled by the caller.
    #[error("generation cancelled after {steps} steps")]
    Cancelled { steps: usize },
}

impl DecodingError {
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::ParameterValidation {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn query(role: ModelRole, source: anyhow::Error) -> Self {
        Self::ModelQuery {
            role,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_query_keeps_source_message() {
        let err = DecodingError::query(ModelRole::Amateur, anyhow::anyhow!("device lost"));
        assert_eq!(err.to_string(), "amateur model query failed");

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("device lost"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        fn fails() -> anyhow::Result<()> {
            Err(DecodingError::invalid("weight", "must be within [0, 1], got 1.5"))?;
            Ok(())
        }

        let err = fails().unwrap_err();
        assert!(err.to_string().contains("weight"));
        assert!(err.downcast_ref::<DecodingError>().is_some());
    }
}
