pub mod contrastive;
pub mod utils;

pub use contrastive::*;
