pub mod config;
pub mod error;
pub mod types;

pub use config::NodeConfig;
pub use error::{CortexError, Result};
pub use types::*;
