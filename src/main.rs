//! colbert-embed: read a JSON array of texts on stdin, print their ColBERT
//! embeddings as JSON on stdout.
//!
//! On failure a single `ERROR: <message>` line goes to stderr and the
//! process exits with status 1.

use std::io;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use colbert_embed::{
    generate_embeddings, read_texts, write_embeddings, Checkpoint, EncoderSettings,
    ExecutionProvider, OutputMode, DEFAULT_CHECKPOINT,
};

#[derive(Parser, Debug)]
#[command(name = "colbert-embed", version, about, long_about = None)]
struct Cli {
    /// Checkpoint to encode with: HuggingFace repository or local model directory
    #[arg(long, env = "COLBERT_EMBED_MODEL", default_value = DEFAULT_CHECKPOINT)]
    model: String,

    /// Emit per-token matrices instead of one vector per text
    #[arg(long)]
    tokens: bool,

    /// Load the INT8 quantized graph (model_int8.onnx)
    #[arg(long)]
    int8: bool,

    /// Hardware to run the model on
    #[arg(long, value_enum, default_value_t = ExecutionProvider::Auto)]
    execution_provider: ExecutionProvider,

    /// Intra-op threads for ONNX Runtime (defaults to available cores)
    #[arg(long)]
    threads: Option<usize>,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colbert_embed=warn,ort=error".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let texts = read_texts(io::stdin().lock())?;

    let mode = if cli.tokens {
        OutputMode::Tokens
    } else {
        OutputMode::Pooled
    };

    let embeddings = generate_embeddings(&texts, &EncoderSettings::default(), mode, |settings| {
        let mut builder = Checkpoint::builder(cli.model.as_str(), settings.clone())
            .with_execution_provider(cli.execution_provider)
            .with_quantized(cli.int8);
        if let Some(threads) = cli.threads {
            builder = builder.with_threads(threads);
        }
        builder.build()
    })?;

    write_embeddings(io::stdout().lock(), &embeddings)?;

    Ok(())
}
