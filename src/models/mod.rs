//! Concrete language models that can serve as expert or amateur.

pub mod components;
pub mod implementations;

pub use implementations::{Qwen2Model, Qwen2Size};
