use thiserror::Error;

/// Validation and conversion failures raised by model types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

impl ModelError {
    /// Stable kind tag suitable for alerting pipelines.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::InvalidField { .. } => "invalid_field",
            ModelError::UnknownVariant { .. } => "unknown_variant",
            ModelError::MissingField(_) => "missing_field",
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
