pub mod attention;
pub mod layers;
pub mod quantization;

pub use attention::{causal_mask, repeat_kv, scaled_dot_product, KvCache, RotaryEmbedding};
pub use layers::{Linear, RmsNorm};
pub use quantization::QMatMul;
