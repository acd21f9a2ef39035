use thiserror::Error;

/// Errors raised by model construction and forward passes.
///
/// Forward passes return `anyhow::Result` and raise these through
/// `anyhow::bail!`, so callers can recover the typed error with
/// `err.downcast_ref::<ModelError>()`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid pre/post-processing wrapper: {0}")]
    InvalidWrapper(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("KV cache overflow in layer {layer}: {len} positions exceed capacity {capacity}")]
    CacheOverflow {
        layer: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Failed to parse JSON configuration")]
    Json(#[source] serde_json::Error),

    #[error("Failed to parse TOML configuration")]
    Toml(#[source] toml::de::Error),

    #[error("Failed to read configuration")]
    Io(#[source] std::io::Error),
}

impl ModelError {
    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
