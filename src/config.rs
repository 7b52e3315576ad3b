//! Encoder settings and checkpoint configuration.
//!
//! [`EncoderSettings`] holds the fixed parameters the encoder runs with.
//! [`CheckpointConfig`] describes the checkpoint itself and is read from
//! `config_sentence_transformers.json` when the model ships one.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

// =============================================================================
// Encoder settings
// =============================================================================

/// Maximum number of tokens kept per document (was 8192, too unstable).
pub const DOC_MAXLEN: usize = 512;

/// Number of candidates per training example.
pub const NWAY: usize = 2;

/// Documents encoded per forward pass.
pub const BATCH_SIZE: usize = 16;

/// Similarity metric the embeddings are prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Vectors are L2-normalized so a dot product is a cosine.
    #[default]
    Cosine,
    /// Vectors are left unnormalized.
    L2,
}

/// Parameters the encoder is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Maximum tokens per document, including `[CLS]`, the marker and `[SEP]`
    pub doc_maxlen: usize,
    /// Candidates per example; kept for parity with training configs
    pub nway: usize,
    /// Similarity the output vectors are normalized for
    pub similarity: Similarity,
    /// Documents per forward pass
    pub batch_size: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            doc_maxlen: DOC_MAXLEN,
            nway: NWAY,
            similarity: Similarity::Cosine,
            batch_size: BATCH_SIZE,
        }
    }
}

impl EncoderSettings {
    /// Check the settings can actually drive an encoder.
    pub fn validate(&self) -> Result<()> {
        // [CLS], the document marker and at least one content token
        if self.doc_maxlen < 3 {
            return Err(Error::Config(format!(
                "doc_maxlen must be at least 3, got {}",
                self.doc_maxlen
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.nway == 0 {
            return Err(Error::Config("nway must be positive".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Checkpoint configuration
// =============================================================================

/// Punctuation ColBERT masks out of document embeddings.
const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Configuration describing a ColBERT checkpoint.
///
/// Loaded from `config_sentence_transformers.json` when present; original
/// ColBERT checkpoints ship without one and get their values detected from
/// the tokenizer instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Prefix marking a document (e.g., "\[D\] " or "\[unused1\]")
    #[serde(default = "default_document_prefix")]
    pub document_prefix: String,

    /// Output embedding dimension
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Whether the graph takes token_type_ids (BERT does, ModernBERT doesn't)
    #[serde(default = "default_uses_token_type_ids")]
    pub uses_token_type_ids: bool,

    /// PAD token ID
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,

    /// Words/punctuation dropped from document embeddings
    #[serde(default)]
    pub skiplist_words: Vec<String>,

    #[serde(default)]
    model_name: Option<String>,
    document_prefix_id: Option<u32>,
}

fn default_document_prefix() -> String {
    "[unused1]".to_string()
}
fn default_embedding_dim() -> usize {
    128
}
fn default_uses_token_type_ids() -> bool {
    true
}
fn default_pad_token_id() -> u32 {
    0
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            document_prefix: default_document_prefix(),
            embedding_dim: default_embedding_dim(),
            uses_token_type_ids: default_uses_token_type_ids(),
            pad_token_id: default_pad_token_id(),
            skiplist_words: Vec::new(),
            model_name: None,
            document_prefix_id: None,
        }
    }
}

impl CheckpointConfig {
    /// Load config from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ModelLoad(format!(
                "failed to read config from {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::ModelLoad(format!(
                "failed to parse config_sentence_transformers.json: {}",
                e
            ))
        })
    }

    /// Load config from a model directory, or detect it from the tokenizer
    /// when the directory has no `config_sentence_transformers.json`.
    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P, tokenizer: &Tokenizer) -> Result<Self> {
        let config_path = model_dir.as_ref().join("config_sentence_transformers.json");
        let mut config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            tracing::info!(
                model_dir = %model_dir.as_ref().display(),
                "checkpoint.config.detected"
            );
            Self::from_tokenizer(tokenizer)
        };
        config.update_token_ids(tokenizer);
        Ok(config)
    }

    /// Create a config by detecting values from the tokenizer vocabulary.
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        let mut config = Self {
            skiplist_words: PUNCTUATION.chars().map(String::from).collect(),
            ..Self::default()
        };

        if let Some(d_id) = tokenizer.token_to_id("[D] ") {
            config.document_prefix_id = Some(d_id);
            config.document_prefix = "[D] ".to_string();
        } else if let Some(d_id) = tokenizer.token_to_id("[unused1]") {
            config.document_prefix_id = Some(d_id);
            config.document_prefix = "[unused1]".to_string();
        }

        config
    }

    fn update_token_ids(&mut self, tokenizer: &Tokenizer) {
        if self.pad_token_id == default_pad_token_id() {
            if let Some(pad_id) = tokenizer.token_to_id("[PAD]") {
                self.pad_token_id = pad_id;
            } else if let Some(pad_id) = tokenizer.token_to_id("<pad>") {
                self.pad_token_id = pad_id;
            }
        }
    }

    /// Token ID of the document marker, from the config or the vocabulary.
    pub fn document_prefix_id(&self, tokenizer: &Tokenizer) -> Result<u32> {
        match self.document_prefix_id {
            Some(id) => Ok(id),
            None => tokenizer.token_to_id(&self.document_prefix).ok_or_else(|| {
                Error::ModelLoad(format!(
                    "document prefix token '{}' not found in tokenizer vocabulary",
                    self.document_prefix
                ))
            }),
        }
    }

    /// Get the model name (if specified in config).
    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }
}
