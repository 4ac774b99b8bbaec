//! Contrastive decoding pipeline: two models of one family, one decoding loop.
//!
//! ```rust,no_run
//! use contrastive_decoding::pipelines::contrastive::*;
//! use contrastive_decoding::models::Qwen2Size;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let pipeline = ContrastivePipelineBuilder::qwen2_coder(Qwen2Size::Coder1_5B, Qwen2Size::Coder0_5B)
//!     .weight(0.5)
//!     .max_tokens(256)
//!     .build()
//!     .await?;
//!
//! let docstring = pipeline.completion("Write a docstring for `fn add(a: i32, b: i32)`").await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod completion_stream;
pub mod model;
pub mod pipeline;
pub mod source;

pub use crate::pipelines::utils::DeviceSelectable;
pub use builder::ContrastivePipelineBuilder;
pub use completion_stream::CompletionStream;
pub use model::{LanguageModelContext, TextGenerationModel};
pub use pipeline::{ContrastivePipeline, Input};
pub use source::ContextSource;
