pub mod config;
pub mod layer;
pub mod model;

pub use config::{Architecture, ModelConfig};
pub use layer::Dense;
pub use model::Model;
