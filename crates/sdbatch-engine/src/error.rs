use thiserror::Error;

/// Reasons a batch is rejected before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A checkpoint, VAE, upscaler, sampler, extension model or style was not
    /// found in the backend catalog.
    #[error("unknown {field} '{name}'")]
    UnknownModelReference { field: String, name: String },

    /// The checkpoint only works with one sampler and another was requested.
    #[error("checkpoint '{checkpoint}' requires sampler '{forced}', got '{sampler}'")]
    InvalidSamplerForModel {
        checkpoint: String,
        sampler: String,
        forced: String,
    },

    #[error("unknown token '{token}' in filename pattern '{pattern}'")]
    UnknownPatternToken { token: String, pattern: String },

    #[error("invalid value for {field}: '{value}'")]
    InvalidValue { field: String, value: String },

    #[error("overlay '{overlay}' cannot be applied: {reason}")]
    InvalidOverlay { overlay: String, reason: String },
}

impl ValidationError {
    pub fn unknown_model(field: &str, name: &str) -> Self {
        Self::UnknownModelReference {
            field: field.to_string(),
            name: name.to_string(),
        }
    }

    pub fn invalid_value(field: &str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.into(),
        }
    }
}
