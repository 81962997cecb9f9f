pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::PipewrightConfig;
pub use error::{FlowError, Result};
pub use traits::Collaborator;
pub use types::*;
