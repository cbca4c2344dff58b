pub mod config;
pub mod error;
pub mod logging;

pub use config::{LoggingConfig, SessionConfig, TimeoutConfig, UploadConfig};
pub use error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;
