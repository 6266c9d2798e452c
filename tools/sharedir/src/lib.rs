pub mod sharedir;

pub use sharedir::{create, Dependency, SharedirConfig, SharedirError};
