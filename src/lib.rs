//! # colbert-embed
//!
//! Encode a batch of texts into embeddings with a pretrained ColBERT
//! checkpoint running on ONNX Runtime.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use colbert_embed::{generate_embeddings, Checkpoint, EncoderSettings, OutputMode};
//!
//! let texts = vec!["Paris is the capital of France.".to_string()];
//! let settings = EncoderSettings::default();
//! let embeddings = generate_embeddings(&texts, &settings, OutputMode::Pooled, |s| {
//!     Checkpoint::load("colbert-ir/colbertv2.0", s.clone())
//! })?;
//! ```
//!
//! The checkpoint identifier is either a local directory or a HuggingFace
//! repository holding `model.onnx` and `tokenizer.json`, plus an optional
//! `config_sentence_transformers.json`.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod run;
pub mod runtime;

pub use checkpoint::{Checkpoint, CheckpointBuilder, DocumentEncoder};
pub use config::{CheckpointConfig, EncoderSettings, Similarity, BATCH_SIZE, DOC_MAXLEN, NWAY};
pub use error::{Error, ErrorKind, Result};
pub use model::{ensure_model, DEFAULT_CHECKPOINT};
pub use pipeline::{
    generate_embeddings, parse_texts, pool_document, read_texts, write_embeddings, Embeddings,
    OutputMode,
};
pub use run::{with_run_context, RunConfig, RunContext};
pub use runtime::{init_ort_runtime, ExecutionProvider};
