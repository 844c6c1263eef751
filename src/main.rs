use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use skywatch::channel::TelegramGateway;
use skywatch::checkpoint::CheckpointStore;
use skywatch::config::{Config, RetrievalPreference};
use skywatch::credentials::Credentials;
use skywatch::extract::{ExtractionClient, ExtractionSettings, OpenAiClient};
use skywatch::governor::{Governor, GovernorConfig, RetryPolicy};
use skywatch::pipeline::{Orchestrator, OrchestratorDeps};
use skywatch::retriever::{MessageRetriever, RetrievalStrategy};
use skywatch::sink::CsvSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = std::env::var("SKYWATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));

    if args.iter().any(|a| a == "--create-config") {
        let example = Path::new("config.example.json");
        Config::save_example(example).context("failed to write example config")?;
        eprintln!("Wrote {}. Copy it to config.json and edit.", example.display());
        return Ok(());
    }

    let config = Config::load(&config_path).context("failed to load configuration")?;

    // Tracing: stdout plus the configured log file.
    let file_dir = config
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = config
        .log_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "skywatch.log".into());
    let file_appender = tracing_appender::rolling::never(file_dir, file_name);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let credentials_path = std::env::var("SKYWATCH_CREDENTIALS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("credentials.json"));
    let credentials = Credentials::load(&credentials_path)?;

    eprintln!("skywatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Channel: {}", config.channel);
    eprintln!("   Phrase: '{}'", config.search_phrase);
    eprintln!("   Model: {}", config.model);
    eprintln!(
        "   Limit: {}",
        config
            .message_limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unlimited".into())
    );
    eprintln!(
        "   Mode: {} / {}",
        match config.retrieval {
            RetrievalPreference::Search => "search",
            RetrievalPreference::Iterate => "iterate",
        },
        if config.incremental {
            "incremental resume"
        } else {
            "fresh pass"
        }
    );
    eprintln!("   Output: {}\n", config.output_file.display());

    // ── Checkpoint ──────────────────────────────────────────────────
    let checkpoint_path = config.checkpoint_path();
    let mut checkpoint = if config.incremental {
        // A corrupt checkpoint aborts here rather than silently starting
        // over and duplicating output.
        CheckpointStore::load(&checkpoint_path)?
    } else {
        CheckpointStore::fresh(&checkpoint_path)
    };

    // Recover ids whose sink row committed but whose checkpoint mark was
    // cut off by a crash between the two writes.
    let existing = CsvSink::existing_ids(&config.output_file)?;
    if !existing.is_empty() {
        tracing::info!(
            rows = existing.len(),
            "Found existing output rows, folding into the checkpoint"
        );
        checkpoint.absorb(existing)?;
    }
    if checkpoint.processed_count() > 0 {
        tracing::info!(
            processed = checkpoint.processed_count(),
            "Resuming: previously handled messages will be skipped"
        );
    }

    // ── Wiring ──────────────────────────────────────────────────────
    let gateway = Arc::new(TelegramGateway::new(
        config.gateway_url.clone(),
        credentials.api_id,
        credentials.api_hash,
    ));

    let strategy = match config.retrieval {
        RetrievalPreference::Search => RetrievalStrategy::Search,
        RetrievalPreference::Iterate => RetrievalStrategy::Iteration,
    };
    let retriever = MessageRetriever::new(
        gateway,
        config.channel.clone(),
        config.search_phrase.clone(),
        strategy,
        config.message_limit,
        checkpoint.cursor(),
    );

    let model = Arc::new(OpenAiClient::new(
        credentials.openai_api_key,
        config.model.clone(),
    ));
    let extractor = Arc::new(ExtractionClient::new(
        model,
        ExtractionSettings {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        },
    ));

    let governor = Arc::new(Governor::new(GovernorConfig {
        max_concurrent: config.max_concurrent_requests,
        pacing_delay: config.request_delay(),
        retry: RetryPolicy {
            max_attempts: config.retry_max_attempts,
            max_elapsed: config.retry_max_elapsed(),
            ..RetryPolicy::default()
        },
    }));

    let sink = CsvSink::open(&config.output_file)?;

    // Ctrl-C flips the shutdown flag; the orchestrator stops dispatching
    // and drains in-flight work within the grace period.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight work");
            let _ = shutdown_tx.send(true);
        }
        // Keep the sender alive so the receiver stays connected.
        std::future::pending::<()>().await;
    });

    let orchestrator = Orchestrator::new(
        OrchestratorDeps {
            retriever,
            extractor,
            governor,
            checkpoint,
            sink,
            shutdown: shutdown_rx,
        },
        config.max_concurrent_requests,
    );

    match orchestrator.run().await {
        Ok(stats) => {
            eprintln!(
                "\nDone: {} extracted, {} without attack data, {} failed, {} skipped as already processed{}",
                stats.ok,
                stats.skipped,
                stats.failed,
                stats.already_processed,
                if stats.abandoned > 0 {
                    format!(", {} abandoned (will retry next run)", stats.abandoned)
                } else {
                    String::new()
                }
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("\nRun aborted: {err}");
            eprintln!("Progress is checkpointed; rerun to resume.");
            std::process::exit(1);
        }
    }
}
