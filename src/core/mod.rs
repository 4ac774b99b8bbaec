pub mod cache;
pub mod chat_template;
pub mod config;
pub mod error;
pub mod message;

pub use cache::{global_cache, ModelOptions, WeightCache};
pub use chat_template::ChatTemplate;
pub use config::{DecodingConfig, DecodingConfigBuilder, GenerationConfig};
pub use error::{DecodingError, ModelRole};
pub use message::{Message, Role};
