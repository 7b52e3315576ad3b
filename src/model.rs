use std::fmt::Display;
use std::path::PathBuf;

use hf_hub::api::sync::ApiBuilder;

use crate::error::{Error, Result};

/// Checkpoint encoded with when no other model is requested.
pub const DEFAULT_CHECKPOINT: &str = "colbert-ir/colbertv2.0";

/// Files every checkpoint must provide besides the ONNX graph.
const REQUIRED_FILES: &[&str] = &["tokenizer.json"];

/// Files fetched when the repository has them.
const OPTIONAL_FILES: &[&str] = &["config_sentence_transformers.json"];

/// Name of the ONNX graph to load.
pub fn onnx_file_name(quantized: bool) -> &'static str {
    if quantized {
        "model_int8.onnx"
    } else {
        "model.onnx"
    }
}

/// Error for a checkpoint that ships no ONNX export.
pub(crate) fn missing_onnx_export(checkpoint: &str, onnx_file: &str, cause: impl Display) -> Error {
    Error::ModelLoad(format!(
        "{} has no {} ({}). Encoding needs an ONNX export of the checkpoint: export it to a \
         directory holding {} and tokenizer.json, then pass that directory with --model or \
         COLBERT_EMBED_MODEL",
        checkpoint, onnx_file, cause, onnx_file
    ))
}

/// Resolve a checkpoint identifier to a local model directory.
///
/// An identifier naming an existing directory is returned as-is. Anything
/// else is treated as a HuggingFace repository and downloaded into the hub
/// cache (reused if already present).
pub fn ensure_model(checkpoint: &str, quantized: bool) -> Result<PathBuf> {
    let local_path = PathBuf::from(checkpoint);
    if local_path.is_dir() {
        return Ok(local_path);
    }

    // Priority: HF_TOKEN > HUGGING_FACE_HUB_TOKEN > token file ($HF_HOME/token)
    let mut builder = ApiBuilder::from_env().with_progress(false);
    let token_from_env = std::env::var("HF_TOKEN")
        .or_else(|_| std::env::var("HUGGING_FACE_HUB_TOKEN"))
        .ok()
        .map(|t| t.trim_matches('"').trim_matches('\'').to_string());
    if token_from_env.is_some() {
        builder = builder.with_token(token_from_env);
    }
    let api = builder
        .build()
        .map_err(|e| Error::ModelLoad(format!("failed to initialize HuggingFace API: {}", e)))?;
    let repo = api.model(checkpoint.to_string());

    tracing::info!(checkpoint = checkpoint, "checkpoint.download.started");

    let mut model_dir = None;
    for file in REQUIRED_FILES {
        let path = repo.get(file).map_err(|e| {
            Error::ModelLoad(format!(
                "failed to fetch {} from {}: {}",
                file, checkpoint, e
            ))
        })?;
        if model_dir.is_none() {
            model_dir = path.parent().map(|p| p.to_path_buf());
        }
    }

    let onnx_file = onnx_file_name(quantized);
    repo.get(onnx_file)
        .map_err(|e| missing_onnx_export(checkpoint, onnx_file, e))?;

    for file in OPTIONAL_FILES {
        if let Err(e) = repo.get(file) {
            tracing::debug!(file = file, error = %e, "checkpoint.optional_file.missing");
        }
    }

    model_dir.ok_or_else(|| {
        Error::ModelLoad(format!(
            "failed to determine model directory for {}",
            checkpoint
        ))
    })
}
