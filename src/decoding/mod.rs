//! Contrastive decoding: greedy selection over the difference between an
//! expert's and an amateur's next-token distributions.

pub mod buffer;
pub mod cancellation;
pub mod combiner;
pub mod generation;

/// An index into the shared vocabulary.
pub type Token = u32;

pub use crate::core::DecodingConfig;
pub use buffer::TokenSequenceBuffer;
pub use cancellation::CancellationToken;
pub use combiner::{combine, DistributionCombiner, Selection};
pub use generation::{
    generate, generate_with_cancellation, greedy, DistributionSource, Generation,
    GenerationResult, Step, StopReason,
};
