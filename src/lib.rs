//! Contrastive decoding for causal language models.
//!
//! At every step the next token is the argmax of
//! `max(p_expert - weight * p_amateur, floor)`, where the two distributions
//! come from a stronger "expert" and a weaker "amateur" model over the same
//! vocabulary.
//!
//! - [`decoding`] holds the model-agnostic core: the combiner, the decoding
//!   loop and its step API.
//! - [`pipelines`] wires two quantized models into that core, with chat
//!   templating, tokenization and streaming.

pub mod core;
pub mod decoding;
mod loaders;
pub mod models;
pub mod pipelines;

// Re-export core types
pub use core::{DecodingConfig, DecodingError, Message, ModelRole, Role};

pub use decoding::{
    combine, generate, generate_with_cancellation, greedy, CancellationToken, DistributionCombiner,
    DistributionSource, Generation, GenerationResult, Step, StopReason, Token,
};

pub use models::{Qwen2Model, Qwen2Size};
pub use pipelines::{ContrastivePipeline, ContrastivePipelineBuilder, DeviceSelectable};
