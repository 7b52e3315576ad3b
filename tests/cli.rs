//! End-to-end tests for the colbert-embed binary.
//!
//! Input validation and failure paths run without a model. The encoding
//! tests are ignored by default; they need an exported ColBERT model
//! directory in `COLBERT_EMBED_TEST_MODEL`:
//!
//! ```sh
//! COLBERT_EMBED_TEST_MODEL=models/colbertv2.0 cargo test -- --ignored
//! ```

use std::io::Write;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn run_with_args(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_colbert-embed"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn colbert-embed");

    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();

    child.wait_with_output().unwrap()
}

fn run(stdin: &str) -> Output {
    run_with_args(&[], stdin)
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn assert_failed_with(output: &Output, message: &str) {
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty(), "nothing may be written to stdout");
    let stderr = stderr_of(output);
    assert!(
        stderr.lines().any(|l| l.starts_with("ERROR: ") && l.contains(message)),
        "unexpected stderr: {}",
        stderr
    );
}

fn test_model() -> String {
    std::env::var("COLBERT_EMBED_TEST_MODEL")
        .expect("COLBERT_EMBED_TEST_MODEL must point at an exported model directory")
}

// =============================================================================
// Input handling
// =============================================================================

#[test]
fn test_malformed_json_fails() {
    let output = run("not json");
    assert_failed_with(&output, "Malformed input: invalid JSON");
}

#[test]
fn test_json_object_fails() {
    let output = run(r#"{"texts": ["hello"]}"#);
    assert_failed_with(&output, "found an object");
}

#[test]
fn test_array_of_numbers_fails() {
    let output = run("[1, 2, 3]");
    assert_failed_with(&output, "element 0 is a number, expected a string");
}

#[test]
fn test_empty_array_prints_empty_array() {
    let output = run("[]");
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "[]\n");
}

#[test]
fn test_missing_model_fails() {
    let empty_model_dir = TempDir::new().unwrap();
    let output = run_with_args(
        &["--model", empty_model_dir.path().to_str().unwrap()],
        r#"["hello world"]"#,
    );
    assert_failed_with(&output, "Model load failed");
    assert_failed_with(&output, "ONNX export");
}

// =============================================================================
// Encoding (requires COLBERT_EMBED_TEST_MODEL)
// =============================================================================

fn encode(model: &str, texts: &[&str]) -> Vec<Vec<f64>> {
    let input = serde_json::to_string(texts).unwrap();
    let output = run_with_args(&["--model", model, "--execution-provider", "cpu"], &input);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
#[ignore = "requires COLBERT_EMBED_TEST_MODEL"]
fn test_one_vector_per_text() {
    let model = test_model();

    let texts = [
        "Paris is the capital of France.",
        "The mitochondria is the powerhouse of the cell.",
        "Rust guarantees memory safety without garbage collection.",
    ];
    let vectors = encode(&model, &texts);

    assert_eq!(vectors.len(), texts.len());
    let dim = vectors[0].len();
    assert!(dim > 0);
    assert!(vectors.iter().all(|v| v.len() == dim));

    for v in &vectors {
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3, "norm was {}", norm);
    }
}

#[test]
#[ignore = "requires COLBERT_EMBED_TEST_MODEL"]
fn test_duplicate_texts_get_identical_vectors() {
    let model = test_model();

    let vectors = encode(&model, &["same text", "different text", "same text"]);
    assert_eq!(vectors[0], vectors[2]);
    assert_ne!(vectors[0], vectors[1]);
}

#[test]
#[ignore = "requires COLBERT_EMBED_TEST_MODEL"]
fn test_reruns_are_deterministic() {
    let model = test_model();

    let texts = ["first document", "second, longer document about search"];
    assert_eq!(encode(&model, &texts), encode(&model, &texts));
}

#[test]
#[ignore = "requires COLBERT_EMBED_TEST_MODEL"]
fn test_token_output_mode() {
    let model = test_model();

    let input = serde_json::to_string(&["a short text"]).unwrap();
    let output = run_with_args(
        &["--model", &model, "--execution-provider", "cpu", "--tokens"],
        &input,
    );
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    let matrices: Vec<Vec<Vec<f64>>> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(matrices.len(), 1);
    // [CLS], the document marker, content tokens, [SEP]
    assert!(matrices[0].len() >= 4);
}
