use thiserror::Error;

/// Structured configuration failures. These are startup-fatal: the binaries
/// print them and exit 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] warden_model::ModelError),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::MissingVar(_) => "missing_var",
            ConfigError::InvalidVar { .. } => "invalid_var",
            ConfigError::Invalid(_) => "invalid_config",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
