//! stdin -> embed -> stdout.
//!
//! [`parse_texts`] validates the input document, [`generate_embeddings`]
//! runs the encoder inside a run context and [`write_embeddings`] prints the
//! result.

use std::collections::HashMap;
use std::io::{Read, Write};

use ndarray::{Array2, Axis};
use serde::Serialize;
use serde_json::Value;

use crate::checkpoint::DocumentEncoder;
use crate::config::{EncoderSettings, Similarity};
use crate::error::{Error, Result};
use crate::run::{with_run_context, RunConfig};

/// Shape of the emitted embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// One vector per text
    #[default]
    Pooled,
    /// One `[num_tokens, dim]` matrix per text
    Tokens,
}

/// Encoded texts, serialized as nested JSON arrays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Embeddings {
    Pooled(Vec<Vec<f32>>),
    Tokens(Vec<Vec<Vec<f32>>>),
}

impl Embeddings {
    fn empty(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Pooled => Embeddings::Pooled(Vec::new()),
            OutputMode::Tokens => Embeddings::Tokens(Vec::new()),
        }
    }

    /// Number of encoded texts.
    pub fn len(&self) -> usize {
        match self {
            Embeddings::Pooled(v) => v.len(),
            Embeddings::Tokens(v) => v.len(),
        }
    }

    /// Whether no text was encoded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read a whole stream and parse it as a JSON array of strings.
pub fn read_texts<R: Read>(mut reader: R) -> Result<Vec<String>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let input = String::from_utf8(bytes)
        .map_err(|e| Error::MalformedInput(format!("input is not valid UTF-8: {}", e)))?;
    parse_texts(&input)
}

/// Parse a JSON array of strings.
pub fn parse_texts(input: &str) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(input)
        .map_err(|e| Error::MalformedInput(format!("invalid JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::MalformedInput(format!(
                "expected a JSON array of strings, found {}",
                json_type(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(text) => Ok(text),
            other => Err(Error::MalformedInput(format!(
                "element {} is {}, expected a string",
                i,
                json_type(&other)
            ))),
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Encode `texts` with an encoder built by `load`.
///
/// The encoder is created and dropped inside a run context. An empty input
/// returns an empty result without loading anything. Duplicate texts are
/// encoded once, so equal inputs always map to equal outputs.
pub fn generate_embeddings<E, F>(
    texts: &[String],
    settings: &EncoderSettings,
    mode: OutputMode,
    load: F,
) -> Result<Embeddings>
where
    E: DocumentEncoder,
    F: FnOnce(&EncoderSettings) -> Result<E>,
{
    if texts.is_empty() {
        tracing::debug!("pipeline.input.empty");
        return Ok(Embeddings::empty(mode));
    }

    let (unique, slots) = dedup_texts(texts);

    let encoded = with_run_context(RunConfig::default(), |_run| {
        settings.validate()?;
        let mut encoder = load(settings)?;
        tracing::debug!(
            embedding_dim = encoder.embedding_dim(),
            batch_size = settings.batch_size,
            "pipeline.encoder.ready"
        );
        let docs = encoder.doc_from_text(&unique, settings.batch_size)?;
        if docs.len() != unique.len() {
            return Err(Error::Encoding(format!(
                "encoder returned {} results for {} texts",
                docs.len(),
                unique.len()
            )));
        }
        Ok(docs)
    })?;

    tracing::info!(
        texts = texts.len(),
        unique = unique.len(),
        "pipeline.encoded"
    );

    let embeddings = match mode {
        OutputMode::Pooled => {
            let pooled: Vec<Vec<f32>> = encoded
                .iter()
                .map(|doc| pool_document(doc, settings.similarity))
                .collect();
            Embeddings::Pooled(slots.iter().map(|&s| pooled[s].clone()).collect())
        }
        OutputMode::Tokens => Embeddings::Tokens(
            slots
                .iter()
                .map(|&s| encoded[s].outer_iter().map(|row| row.to_vec()).collect())
                .collect(),
        ),
    };

    Ok(embeddings)
}

/// Distinct texts in first-seen order, and for every input its slot among them.
fn dedup_texts(texts: &[String]) -> (Vec<&str>, Vec<usize>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut unique = Vec::new();
    let slots = texts
        .iter()
        .map(|text| {
            *seen.entry(text.as_str()).or_insert_with(|| {
                unique.push(text.as_str());
                unique.len() - 1
            })
        })
        .collect();
    (unique, slots)
}

/// Reduce a document's token matrix to a single vector.
///
/// Mean of the token rows; L2-normalized for cosine similarity.
pub fn pool_document(tokens: &Array2<f32>, similarity: Similarity) -> Vec<f32> {
    let Some(mut mean) = tokens.mean_axis(Axis(0)) else {
        return vec![0.0; tokens.ncols()];
    };

    if similarity == Similarity::Cosine {
        let norm = mean.dot(&mean).sqrt();
        if norm > 1e-12 {
            mean.mapv_inplace(|x| x / norm);
        }
    }

    mean.to_vec()
}

/// Write embeddings as one JSON document followed by a newline, then flush.
pub fn write_embeddings<W: Write>(mut writer: W, embeddings: &Embeddings) -> Result<()> {
    serde_json::to_writer(&mut writer, embeddings)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
