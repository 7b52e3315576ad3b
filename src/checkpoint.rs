//! ColBERT checkpoint: tokenizer, ONNX session and document encoding.
//!
//! Documents are tokenized without the document marker, truncated to
//! `doc_maxlen - 1` tokens and then get the marker inserted right after
//! `[CLS]`, the same layout ColBERT produces. Batches are formed from
//! length-sorted documents to keep padding small; results come back in
//! input order.

use std::collections::HashSet;
use std::path::Path;

use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Tokenizer, TruncationParams};

use crate::config::{CheckpointConfig, EncoderSettings};
use crate::error::{Error, Result};
use crate::model::{ensure_model, missing_onnx_export, onnx_file_name};
use crate::runtime::{configure_execution_provider, init_ort_runtime, ExecutionProvider};

/// Anything that turns documents into per-token embedding matrices.
pub trait DocumentEncoder {
    /// Width of every embedding row.
    fn embedding_dim(&self) -> usize;

    /// Encode documents, `bsize` at a time.
    ///
    /// Returns one `[num_tokens, embedding_dim]` matrix per document, in the
    /// order the documents were given.
    fn doc_from_text(&mut self, docs: &[&str], bsize: usize) -> Result<Vec<Array2<f32>>>;
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for configuring a [`Checkpoint`].
pub struct CheckpointBuilder {
    checkpoint: String,
    settings: EncoderSettings,
    execution_provider: ExecutionProvider,
    quantized: bool,
    num_threads: usize,
}

impl CheckpointBuilder {
    /// Create a builder for a checkpoint identifier (HuggingFace repo or local dir).
    pub fn new(checkpoint: impl Into<String>, settings: EncoderSettings) -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            checkpoint: checkpoint.into(),
            settings,
            execution_provider: ExecutionProvider::Auto,
            quantized: false,
            num_threads,
        }
    }

    /// Set the hardware acceleration provider.
    pub fn with_execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.execution_provider = provider;
        self
    }

    /// Load `model_int8.onnx` instead of `model.onnx`.
    pub fn with_quantized(mut self, quantized: bool) -> Self {
        self.quantized = quantized;
        self
    }

    /// Set the number of intra-op threads ONNX Runtime may use.
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Resolve, load and initialize the checkpoint.
    pub fn build(self) -> Result<Checkpoint> {
        self.settings.validate()?;
        init_ort_runtime();

        let model_dir = ensure_model(&self.checkpoint, self.quantized)?;
        let onnx_file = onnx_file_name(self.quantized);
        let onnx_path = model_dir.join(onnx_file);
        if !onnx_path.exists() {
            return Err(missing_onnx_export(
                &self.checkpoint,
                onnx_file,
                format!("not found at {}", onnx_path.display()),
            ));
        }

        let tokenizer = load_tokenizer(&model_dir, self.settings.doc_maxlen)?;
        let config = CheckpointConfig::from_model_dir(&model_dir, &tokenizer)?;
        let prefix_id = config.document_prefix_id(&tokenizer)?;
        let skiplist_ids = build_skiplist(&config, &tokenizer);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.num_threads)?;
        let builder = configure_execution_provider(builder, self.execution_provider)?;
        let session = builder
            .commit_from_file(&onnx_path)
            .map_err(|e| Error::ModelLoad(format!("failed to load ONNX model: {}", e)))?;

        tracing::info!(
            checkpoint = %self.checkpoint,
            model_dir = %model_dir.display(),
            provider = ?self.execution_provider,
            quantized = self.quantized,
            doc_maxlen = self.settings.doc_maxlen,
            nway = self.settings.nway,
            similarity = ?self.settings.similarity,
            embedding_dim = config.embedding_dim,
            model_name = config.model_name().unwrap_or("unknown"),
            "checkpoint.loaded"
        );

        Ok(Checkpoint {
            session,
            tokenizer,
            config,
            settings: self.settings,
            prefix_id,
            skiplist_ids,
        })
    }
}

fn load_tokenizer(model_dir: &Path, doc_maxlen: usize) -> Result<Tokenizer> {
    let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
        .map_err(|e| Error::ModelLoad(format!("failed to load tokenizer: {}", e)))?;
    configure_tokenizer(tokenizer, doc_maxlen)
}

/// Disable padding and truncate to `doc_maxlen - 1` tokens, special tokens
/// included. The remaining slot is taken by the document marker.
fn configure_tokenizer(mut tokenizer: Tokenizer, doc_maxlen: usize) -> Result<Tokenizer> {
    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: doc_maxlen - 1,
            ..Default::default()
        }))
        .map_err(|e| Error::ModelLoad(format!("failed to configure truncation: {}", e)))?;

    Ok(tokenizer)
}

fn build_skiplist(config: &CheckpointConfig, tokenizer: &Tokenizer) -> HashSet<u32> {
    config
        .skiplist_words
        .iter()
        .filter_map(|word| tokenizer.token_to_id(word))
        .collect()
}

// =============================================================================
// Checkpoint
// =============================================================================

/// A loaded ColBERT checkpoint.
///
/// Owns the ONNX session and tokenizer; both are released when the value is
/// dropped.
pub struct Checkpoint {
    session: Session,
    tokenizer: Tokenizer,
    config: CheckpointConfig,
    settings: EncoderSettings,
    prefix_id: u32,
    skiplist_ids: HashSet<u32>,
}

impl Checkpoint {
    /// Load a checkpoint with default device and thread settings.
    pub fn load(checkpoint: &str, settings: EncoderSettings) -> Result<Self> {
        CheckpointBuilder::new(checkpoint, settings).build()
    }

    /// Create a builder for advanced configuration.
    pub fn builder(checkpoint: impl Into<String>, settings: EncoderSettings) -> CheckpointBuilder {
        CheckpointBuilder::new(checkpoint, settings)
    }

    fn run_batch(&mut self, docs: &[&DocTokens]) -> Result<Vec<Array2<f32>>> {
        let batch = build_batch(docs, self.config.pad_token_id);
        let shape = [batch.batch_size, batch.seq_len];

        let input_ids = Tensor::from_array((shape, batch.input_ids))?;
        let attention_mask = Tensor::from_array((shape, batch.attention_mask))?;

        let outputs = if self.config.uses_token_type_ids {
            let token_type_ids = Tensor::from_array((shape, batch.token_type_ids))?;
            self.session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])?
        } else {
            self.session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])?
        };

        let (output_shape, output_data) = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Encoding(format!("failed to extract output tensor: {}", e)))?;

        let dims: Vec<i64> = output_shape.iter().copied().collect();
        if dims.len() != 3
            || dims[0] as usize != batch.batch_size
            || dims[1] as usize != batch.seq_len
        {
            return Err(Error::Encoding(format!(
                "unexpected output shape {:?} for batch [{}, {}]",
                dims, batch.batch_size, batch.seq_len
            )));
        }

        extract_embeddings(
            output_data,
            dims[2] as usize,
            batch.seq_len,
            docs,
            &self.skiplist_ids,
        )
    }
}

impl DocumentEncoder for Checkpoint {
    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn doc_from_text(&mut self, docs: &[&str], bsize: usize) -> Result<Vec<Array2<f32>>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = tokenize_documents(
            &self.tokenizer,
            docs,
            self.prefix_id,
            self.settings.doc_maxlen,
        )?;

        encode_in_length_order(&tokens, bsize, |batch| {
            let embeddings = self.run_batch(batch)?;
            tracing::debug!(batch_size = batch.len(), "checkpoint.batch.encoded");
            Ok(embeddings)
        })
    }
}

// =============================================================================
// Tokenization and batching
// =============================================================================

/// Token-level view of one document, marker included.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DocTokens {
    token_ids: Vec<u32>,
    token_type_ids: Vec<u32>,
}

impl DocTokens {
    fn len(&self) -> usize {
        self.token_ids.len()
    }
}

fn tokenize_documents(
    tokenizer: &Tokenizer,
    docs: &[&str],
    prefix_id: u32,
    doc_maxlen: usize,
) -> Result<Vec<DocTokens>> {
    let encodings = tokenizer
        .encode_batch(docs.to_vec(), true)
        .map_err(|e| Error::Encoding(format!("tokenization error: {}", e)))?;

    let truncate_limit = doc_maxlen - 1;

    let tokens = encodings
        .into_iter()
        .map(|encoding| {
            let mut token_ids = encoding.get_ids().to_vec();
            let mut token_type_ids = encoding.get_type_ids().to_vec();
            token_ids.truncate(truncate_limit);
            token_type_ids.truncate(truncate_limit);

            // Marker goes after [CLS]
            let at = token_ids.len().min(1);
            token_ids.insert(at, prefix_id);
            token_type_ids.insert(at, 0);

            DocTokens {
                token_ids,
                token_type_ids,
            }
        })
        .collect();

    Ok(tokens)
}

/// Indices of `tokens` ordered by sequence length (stable).
fn length_sorted_order(tokens: &[DocTokens]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..tokens.len()).collect();
    order.sort_by_key(|&i| tokens[i].len());
    order
}

/// Run `encode` over length-sorted chunks of at most `bsize` documents and
/// return the results in the original document order.
fn encode_in_length_order<F>(
    tokens: &[DocTokens],
    bsize: usize,
    mut encode: F,
) -> Result<Vec<Array2<f32>>>
where
    F: FnMut(&[&DocTokens]) -> Result<Vec<Array2<f32>>>,
{
    let order = length_sorted_order(tokens);
    let mut results: Vec<Option<Array2<f32>>> = vec![None; tokens.len()];

    for chunk in order.chunks(bsize.max(1)) {
        let batch: Vec<&DocTokens> = chunk.iter().map(|&i| &tokens[i]).collect();
        let embeddings = encode(&batch)?;
        if embeddings.len() != batch.len() {
            return Err(Error::Encoding(format!(
                "batch of {} documents produced {} embeddings",
                batch.len(),
                embeddings.len()
            )));
        }
        for (&i, emb) in chunk.iter().zip(embeddings) {
            results[i] = Some(emb);
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(i, emb)| {
            emb.ok_or_else(|| Error::Encoding(format!("document {} was not encoded", i)))
        })
        .collect()
}

/// Padded, row-major model inputs for one batch.
struct Batch {
    batch_size: usize,
    seq_len: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
}

fn build_batch(docs: &[&DocTokens], pad_token_id: u32) -> Batch {
    let batch_size = docs.len();
    let seq_len = docs.iter().map(|d| d.len()).max().unwrap_or(0);

    let mut input_ids = Vec::with_capacity(batch_size * seq_len);
    let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
    let mut token_type_ids = Vec::with_capacity(batch_size * seq_len);

    for doc in docs {
        let pad = seq_len - doc.len();

        input_ids.extend(doc.token_ids.iter().map(|&id| id as i64));
        input_ids.extend(std::iter::repeat(pad_token_id as i64).take(pad));

        attention_mask.extend(std::iter::repeat(1i64).take(doc.len()));
        attention_mask.extend(std::iter::repeat(0i64).take(pad));

        token_type_ids.extend(doc.token_type_ids.iter().map(|&id| id as i64));
        token_type_ids.extend(std::iter::repeat(0i64).take(pad));
    }

    Batch {
        batch_size,
        seq_len,
        input_ids,
        attention_mask,
        token_type_ids,
    }
}

/// Split a `[batch, seq_len, dim]` output into per-document matrices,
/// dropping padding and skiplist tokens.
fn extract_embeddings(
    output: &[f32],
    embedding_dim: usize,
    seq_len: usize,
    docs: &[&DocTokens],
    skiplist_ids: &HashSet<u32>,
) -> Result<Vec<Array2<f32>>> {
    let mut all_embeddings = Vec::with_capacity(docs.len());

    for (i, doc) in docs.iter().enumerate() {
        let batch_offset = i * seq_len * embedding_dim;

        let mut flat: Vec<f32> = Vec::with_capacity(doc.len() * embedding_dim);
        let mut kept = 0usize;
        for (j, token_id) in doc.token_ids.iter().enumerate() {
            if skiplist_ids.contains(token_id) {
                continue;
            }
            let start = batch_offset + j * embedding_dim;
            flat.extend_from_slice(&output[start..start + embedding_dim]);
            kept += 1;
        }

        all_embeddings.push(Array2::from_shape_vec((kept, embedding_dim), flat)?);
    }

    Ok(all_embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DOC_MAXLEN;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::processors::template::TemplateProcessing;

    const CLS: u32 = 1;
    const SEP: u32 = 2;
    const MARKER: u32 = 3;

    fn test_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = [
            ("[PAD]", 0),
            ("[CLS]", CLS),
            ("[SEP]", SEP),
            ("[unused1]", MARKER),
            ("[UNK]", 4),
            ("paris", 5),
            ("is", 6),
            ("the", 7),
            ("capital", 8),
            (".", 9),
        ]
        .into_iter()
        .map(|(w, id)| (w.to_string(), id))
        .collect();

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer.with_post_processor(Some(
            TemplateProcessing::builder()
                .try_single("[CLS] $A [SEP]")
                .unwrap()
                .special_tokens(vec![("[CLS]", CLS), ("[SEP]", SEP)])
                .build()
                .unwrap(),
        ));
        tokenizer
    }

    fn doc(ids: &[u32]) -> DocTokens {
        DocTokens {
            token_ids: ids.to_vec(),
            token_type_ids: vec![0; ids.len()],
        }
    }

    // =========================================================================
    // Tokenization tests
    // =========================================================================

    #[test]
    fn test_marker_inserted_after_cls() {
        let tokenizer = test_tokenizer();
        let tokens =
            tokenize_documents(&tokenizer, &["paris is the capital"], MARKER, 512).unwrap();

        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token_ids, vec![CLS, MARKER, 5, 6, 7, 8, SEP]);
        assert_eq!(tokens[0].token_type_ids.len(), tokens[0].token_ids.len());
    }

    #[test]
    fn test_truncation_keeps_sep_and_room_for_marker() {
        let tokenizer = configure_tokenizer(test_tokenizer(), 4).unwrap();
        let tokens =
            tokenize_documents(&tokenizer, &["paris is the capital", ""], MARKER, 4).unwrap();

        assert_eq!(tokens[0].token_ids, vec![CLS, MARKER, 5, SEP]);
        assert_eq!(tokens[1].token_ids, vec![CLS, MARKER, SEP]);
    }

    #[test]
    fn test_long_document_fills_doc_maxlen() {
        let tokenizer = configure_tokenizer(test_tokenizer(), DOC_MAXLEN).unwrap();
        let long_doc = vec!["paris"; 2 * DOC_MAXLEN].join(" ");
        let tokens =
            tokenize_documents(&tokenizer, &[long_doc.as_str()], MARKER, DOC_MAXLEN).unwrap();

        let ids = &tokens[0].token_ids;
        assert_eq!(ids.len(), DOC_MAXLEN);
        assert_eq!(ids[..2], [CLS, MARKER]);
        assert_eq!(ids.last(), Some(&SEP));
        assert_eq!(tokens[0].token_type_ids.len(), DOC_MAXLEN);
    }

    #[test]
    fn test_config_detected_from_tokenizer() {
        let tokenizer = test_tokenizer();
        let config = CheckpointConfig::from_tokenizer(&tokenizer);

        assert_eq!(config.document_prefix, "[unused1]");
        assert_eq!(config.document_prefix_id(&tokenizer).unwrap(), MARKER);

        let skiplist = build_skiplist(&config, &tokenizer);
        assert_eq!(skiplist, HashSet::from([9]));
    }

    #[test]
    fn test_missing_document_marker_is_an_error() {
        let tokenizer = test_tokenizer();
        let config: CheckpointConfig =
            serde_json::from_str(r#"{"document_prefix": "[D] "}"#).unwrap();

        let err = config.document_prefix_id(&tokenizer).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    // =========================================================================
    // Batching tests
    // =========================================================================

    #[test]
    fn test_length_sorted_order_is_stable() {
        let tokens = vec![
            doc(&[1, 3, 5, 2]),
            doc(&[1, 3, 2]),
            doc(&[1, 3, 6, 2]),
            doc(&[1, 3, 2]),
        ];
        assert_eq!(length_sorted_order(&tokens), vec![1, 3, 0, 2]);
    }

    /// One row per token holding the token id, so results can be traced
    /// back to the document they came from.
    fn echo_batch(batch: &[&DocTokens]) -> Result<Vec<Array2<f32>>> {
        Ok(batch
            .iter()
            .map(|d| Array2::from_shape_fn((d.len(), 1), |(r, _)| d.token_ids[r] as f32))
            .collect())
    }

    #[test]
    fn test_encode_in_length_order_restores_input_order() {
        let tokens = vec![
            doc(&[1, 3, 10, 11, 12, 2]),
            doc(&[1, 3, 20, 2]),
            doc(&[1, 3, 30, 31, 32, 33, 2]),
            doc(&[1, 3, 2]),
            doc(&[1, 3, 50, 51, 2]),
        ];
        let mut batches: Vec<Vec<usize>> = Vec::new();

        let embeddings = encode_in_length_order(&tokens, 2, |batch| {
            batches.push(batch.iter().map(|d| d.len()).collect());
            echo_batch(batch)
        })
        .unwrap();

        assert_eq!(batches, vec![vec![3, 4], vec![5, 6], vec![7]]);
        assert_eq!(embeddings.len(), tokens.len());
        for (emb, expected) in embeddings.iter().zip(&tokens) {
            let ids: Vec<u32> = emb.column(0).iter().map(|&v| v as u32).collect();
            assert_eq!(ids, expected.token_ids);
        }
    }

    #[test]
    fn test_encode_in_length_order_rejects_short_batch() {
        let tokens = vec![doc(&[1, 3, 2]), doc(&[1, 3, 5, 2])];
        let result = encode_in_length_order(&tokens, 16, |batch| echo_batch(&batch[..1]));
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn test_encode_in_length_order_propagates_batch_error() {
        let tokens = vec![doc(&[1, 3, 2])];
        let result = encode_in_length_order(&tokens, 16, |_| {
            Err(Error::Encoding("session failed".to_string()))
        });
        assert!(matches!(result, Err(Error::Encoding(msg)) if msg == "session failed"));
    }

    #[test]
    fn test_build_batch_pads_to_longest() {
        let a = doc(&[1, 3, 5, 6, 2]);
        let b = doc(&[1, 3, 2]);
        let batch = build_batch(&[&a, &b], 0);

        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.seq_len, 5);
        assert_eq!(batch.input_ids, vec![1, 3, 5, 6, 2, 1, 3, 2, 0, 0]);
        assert_eq!(batch.attention_mask, vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 0]);
        assert_eq!(batch.token_type_ids, vec![0; 10]);
    }

    #[test]
    fn test_extract_embeddings_drops_padding_and_skiplist() {
        let a = doc(&[1, 3, 9, 2]);
        let b = doc(&[1, 3, 2]);
        let seq_len = 4;
        let dim = 2;

        // Row value encodes (doc, position) so we can see which rows survive.
        let output: Vec<f32> = (0..2 * seq_len)
            .flat_map(|r| [r as f32, r as f32])
            .collect();

        let skiplist = HashSet::from([9]);
        let embeddings = extract_embeddings(&output, dim, seq_len, &[&a, &b], &skiplist).unwrap();

        assert_eq!(embeddings[0].dim(), (3, 2));
        assert_eq!(embeddings[0].column(0).to_vec(), vec![0.0, 1.0, 3.0]);
        assert_eq!(embeddings[1].dim(), (3, 2));
        assert_eq!(embeddings[1].column(0).to_vec(), vec![4.0, 5.0, 6.0]);
    }

    // =========================================================================
    // Builder tests
    // =========================================================================

    #[test]
    fn test_builder_defaults() {
        let builder = CheckpointBuilder::new("colbert-ir/colbertv2.0", EncoderSettings::default());

        assert_eq!(builder.checkpoint, "colbert-ir/colbertv2.0");
        assert_eq!(builder.execution_provider, ExecutionProvider::Auto);
        assert!(!builder.quantized);
        assert!(builder.num_threads >= 1);
    }

    #[test]
    fn test_builder_chained_configuration() {
        let builder = Checkpoint::builder("models/colbertv2.0", EncoderSettings::default())
            .with_execution_provider(ExecutionProvider::Cpu)
            .with_quantized(true)
            .with_threads(0);

        assert_eq!(builder.execution_provider, ExecutionProvider::Cpu);
        assert!(builder.quantized);
        assert_eq!(builder.num_threads, 1);
    }

    #[test]
    fn test_build_fails_without_onnx_model() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().to_str().unwrap();
        let result = CheckpointBuilder::new(checkpoint, EncoderSettings::default())
            .with_execution_provider(ExecutionProvider::Cpu)
            .build();

        match result {
            Err(Error::ModelLoad(msg)) => {
                assert!(msg.contains("has no model.onnx"));
                assert!(msg.contains("ONNX export"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected a model load failure"),
        }
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let settings = EncoderSettings {
            batch_size: 0,
            ..EncoderSettings::default()
        };
        let result = CheckpointBuilder::new("unused", settings).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
