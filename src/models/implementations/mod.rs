pub mod qwen2;

pub use qwen2::{Qwen2Model, Qwen2Size};
