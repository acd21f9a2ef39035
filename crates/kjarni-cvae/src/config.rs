//! Hyperparameters shared read-only by every layer of the model.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Id of the padding token. Embeddings of this id are zeroed and it doubles as
/// the initial decoder input.
pub const PAD_ID: u32 = 0;

/// Default end-of-sequence id.
pub const EOS_ID: u32 = 1;

/// Hyperparameters for the conditional variational transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerParams {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_filter_size")]
    pub filter_size: usize,
    #[serde(default = "default_latent_size")]
    pub latent_size: usize,

    #[serde(default = "default_dropout")]
    pub layer_postprocess_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    #[serde(default = "default_dropout")]
    pub relu_dropout: f32,
    #[serde(default = "default_true")]
    pub allow_ffn_pad: bool,

    #[serde(default = "default_initializer_gain")]
    pub initializer_gain: f32,

    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_extra_decode_length")]
    pub extra_decode_length: usize,
    #[serde(default = "default_eos_id")]
    pub eos_id: u32,
}

fn default_vocab_size() -> usize {
    33708
}
fn default_hidden_size() -> usize {
    512
}
fn default_num_heads() -> usize {
    8
}
fn default_num_hidden_layers() -> usize {
    6
}
fn default_filter_size() -> usize {
    2048
}
fn default_latent_size() -> usize {
    256
}
fn default_dropout() -> f32 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_initializer_gain() -> f32 {
    1.0
}
fn default_beam_size() -> usize {
    4
}
fn default_alpha() -> f32 {
    0.6
}
fn default_extra_decode_length() -> usize {
    50
}
fn default_eos_id() -> u32 {
    EOS_ID
}

impl Default for TransformerParams {
    fn default() -> Self {
        Self::base()
    }
}

impl TransformerParams {
    pub fn base() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_heads: default_num_heads(),
            num_hidden_layers: default_num_hidden_layers(),
            filter_size: default_filter_size(),
            latent_size: default_latent_size(),
            layer_postprocess_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            relu_dropout: default_dropout(),
            allow_ffn_pad: true,
            initializer_gain: default_initializer_gain(),
            beam_size: default_beam_size(),
            alpha: default_alpha(),
            extra_decode_length: default_extra_decode_length(),
            eos_id: EOS_ID,
        }
    }

    pub fn big() -> Self {
        Self {
            hidden_size: 1024,
            num_heads: 16,
            filter_size: 4096,
            latent_size: 512,
            layer_postprocess_dropout: 0.3,
            ..Self::base()
        }
    }

    /// Small enough to run in unit tests and on a laptop CPU.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 32,
            num_heads: 4,
            num_hidden_layers: 2,
            filter_size: 64,
            latent_size: 8,
            extra_decode_length: 8,
            ..Self::base()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn from_json_str(json: &str) -> ModelResult<Self> {
        let params: Self = serde_json::from_str(json).map_err(ModelError::Json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_toml_str(text: &str) -> ModelResult<Self> {
        let params: Self = toml::from_str(text).map_err(ModelError::Toml)?;
        params.validate()?;
        Ok(params)
    }

    /// Loads parameters from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(ModelError::Io)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    pub fn to_json(&self) -> ModelResult<String> {
        serde_json::to_string_pretty(self).map_err(ModelError::Json)
    }

    pub fn validate(&self) -> ModelResult<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_heads", self.num_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("filter_size", self.filter_size),
            ("latent_size", self.latent_size),
            ("beam_size", self.beam_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.hidden_size % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "hidden_size {} must be even for sinusoidal position encoding",
                self.hidden_size
            )));
        }
        let rates = [
            ("layer_postprocess_dropout", self.layer_postprocess_dropout),
            ("attention_dropout", self.attention_dropout),
            ("relu_dropout", self.relu_dropout),
        ];
        for (name, rate) in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::InvalidConfig(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        if !(self.alpha >= 0.0 && self.alpha.is_finite()) {
            return Err(ModelError::InvalidConfig(format!(
                "alpha must be a finite non-negative length penalty exponent, got {}",
                self.alpha
            )));
        }
        if self.eos_id == PAD_ID || self.eos_id as usize >= self.vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "eos_id {} must be a non-padding id below vocab_size {}",
                self.eos_id, self.vocab_size
            )));
        }
        Ok(())
    }

    /// Same parameters with every dropout rate set to zero.
    pub fn without_dropout(mut self) -> Self {
        self.layer_postprocess_dropout = 0.0;
        self.attention_dropout = 0.0;
        self.relu_dropout = 0.0;
        self
    }
}
