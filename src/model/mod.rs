//! Model backends and weight loading.

mod auto_model;
mod base;
mod format;
mod loader;
mod transformer;

pub use auto_model::AutoModel;
pub use base::ForwardPass;
pub use format::ModelFormat;
pub use loader::{weight_files, WeightLoader};
pub use transformer::TransformerModel;
