//! ONNX Runtime setup: dynamic library discovery and device selection.

use std::sync::Once;

use ort::session::builder::SessionBuilder;

#[cfg(feature = "coreml")]
use ort::execution_providers::CoreMLExecutionProvider;
#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

use crate::error::{Error, Result};

// =============================================================================
// Library discovery
// =============================================================================

static ORT_INIT: Once = Once::new();

/// Point `ort` at an ONNX Runtime shared library.
///
/// An existing `ORT_DYLIB_PATH` always wins. Otherwise common install
/// locations are searched once per process.
pub fn init_ort_runtime() {
    ORT_INIT.call_once(|| {
        if std::env::var("ORT_DYLIB_PATH").is_ok() {
            return;
        }

        match find_onnxruntime_library() {
            Some(lib_path) => {
                tracing::debug!(path = %lib_path, "ort.library.found");
                std::env::set_var("ORT_DYLIB_PATH", &lib_path);
            }
            None => tracing::debug!("ort.library.not_found"),
        }
    });
}

#[cfg(target_os = "macos")]
const LIB_GLOB: &str = "libonnxruntime*.dylib";
#[cfg(not(target_os = "macos"))]
const LIB_GLOB: &str = "libonnxruntime.so*";

fn search_patterns(home: Option<&str>) -> Vec<String> {
    let mut patterns = Vec::new();

    if let Some(home) = home {
        for venv in [".venv", "venv", ".local"] {
            patterns.push(format!(
                "{}/{}/lib/python*/site-packages/onnxruntime/capi/{}",
                home, venv, LIB_GLOB
            ));
        }
        patterns.push(format!(
            "{}/.cache/uv/archive-v*/*/onnxruntime/capi/{}",
            home, LIB_GLOB
        ));
        for conda in ["anaconda3", "miniconda3"] {
            patterns.push(format!("{}/{}/lib/{}", home, conda, LIB_GLOB));
        }
    }

    patterns.push(format!(
        ".venv/lib/python*/site-packages/onnxruntime/capi/{}",
        LIB_GLOB
    ));
    for dir in ["/usr/local/lib", "/usr/lib", "/usr/lib/x86_64-linux-gnu", "/opt/homebrew/lib"] {
        patterns.push(format!("{}/{}", dir, LIB_GLOB));
    }

    patterns
}

/// Find the ONNX Runtime library in common installation locations.
fn find_onnxruntime_library() -> Option<String> {
    let home = std::env::var("HOME").ok();

    for pattern in search_patterns(home.as_deref()) {
        let Ok(paths) = glob::glob(&pattern) else {
            continue;
        };
        if let Some(path) = paths.flatten().find(|p| p.is_file()) {
            return Some(path.to_string_lossy().to_string());
        }
    }

    None
}

// =============================================================================
// Execution providers
// =============================================================================

/// Hardware the ONNX session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExecutionProvider {
    /// Use the best compiled-in accelerator, falling back to CPU
    #[default]
    Auto,
    /// CPU execution only
    Cpu,
    /// NVIDIA GPUs, requires the `cuda` feature
    Cuda,
    /// Apple Silicon, requires the `coreml` feature
    #[value(name = "coreml")]
    CoreML,
}

/// Register the requested execution provider on a session builder.
pub fn configure_execution_provider(
    builder: SessionBuilder,
    provider: ExecutionProvider,
) -> Result<SessionBuilder> {
    match provider {
        ExecutionProvider::Auto => Ok(configure_auto_provider(builder)),
        ExecutionProvider::Cpu => Ok(builder),
        ExecutionProvider::Cuda => configure_cuda(builder),
        ExecutionProvider::CoreML => configure_coreml(builder),
    }
}

fn configure_auto_provider(builder: SessionBuilder) -> SessionBuilder {
    #[cfg(feature = "cuda")]
    {
        if let Ok(b) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            return b;
        }
    }

    #[cfg(feature = "coreml")]
    {
        if let Ok(b) = builder
            .clone()
            .with_execution_providers([CoreMLExecutionProvider::default().build()])
        {
            return b;
        }
    }

    builder
}

#[cfg(feature = "cuda")]
fn configure_cuda(builder: SessionBuilder) -> Result<SessionBuilder> {
    builder
        .with_execution_providers([CUDAExecutionProvider::default().build()])
        .map_err(|e| {
            Error::ModelLoad(format!("failed to configure CUDA execution provider: {}", e))
        })
}

#[cfg(not(feature = "cuda"))]
fn configure_cuda(_builder: SessionBuilder) -> Result<SessionBuilder> {
    Err(Error::ModelLoad(
        "CUDA support not compiled. Enable the 'cuda' feature.".to_string(),
    ))
}

#[cfg(feature = "coreml")]
fn configure_coreml(builder: SessionBuilder) -> Result<SessionBuilder> {
    builder
        .with_execution_providers([CoreMLExecutionProvider::default().build()])
        .map_err(|e| {
            Error::ModelLoad(format!("failed to configure CoreML execution provider: {}", e))
        })
}

#[cfg(not(feature = "coreml"))]
fn configure_coreml(_builder: SessionBuilder) -> Result<SessionBuilder> {
    Err(Error::ModelLoad(
        "CoreML support not compiled. Enable the 'coreml' feature.".to_string(),
    ))
}
