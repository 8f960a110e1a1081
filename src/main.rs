// src/main.rs

//! Runs a sequenced dispatcher over the in-memory broker.
//!
//! Demo messages are published to the configured destination before the
//! dispatcher starts; a key-sequenced handler then processes them per key in
//! order. The process runs until SIGINT or SIGTERM and logs the shutdown report.

use anyhow::{Context, Result};
use async_trait::async_trait;
use seqdispatch::SequencedDispatcher;
use seqdispatch::broker::memory::MemoryBroker;
use seqdispatch::config::{Config, KeySource};
use seqdispatch::core::handler::{KeySequencedHandler, MessageProcessor};
use seqdispatch::core::keys::{JsonFieldKeyExtractor, KeyExtractor, KeyedMessage, PropertyKeyExtractor};
use seqdispatch::core::metrics;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "seqdispatch.toml";

/// Logs every message after a simulated amount of work.
struct LoggingProcessor {
    processing_time: Duration,
}

#[async_trait]
impl MessageProcessor for LoggingProcessor {
    async fn process(&self, message: &KeyedMessage) -> Result<()> {
        tokio::time::sleep(self.processing_time).await;
        info!(
            key = %message.key,
            message_id = %message.message.message_id,
            redelivered = message.message.redelivered,
            "Processed {}",
            String::from_utf8_lossy(&message.message.body)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("seqdispatch version {VERSION}");
        return Ok(());
    }

    // An explicitly given config file must exist; the default one is optional.
    let explicit_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config = match explicit_path {
        Some(path) => Config::from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::from_file(DEFAULT_CONFIG_PATH),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    // Get initial log level from env var or config.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    if let Err(e) = run(config).await {
        error!("Dispatcher runtime error: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let broker = MemoryBroker::new();
    publish_demo_messages(&broker, &config);

    let extractor: Arc<dyn KeyExtractor> = match &config.key {
        KeySource::Property(name) => Arc::new(PropertyKeyExtractor::new(name.clone())),
        KeySource::JsonField(name) => Arc::new(JsonFieldKeyExtractor::new(name.clone())),
    };
    let handler = Arc::new(KeySequencedHandler::new(LoggingProcessor {
        processing_time: config.demo.processing_time,
    }));

    let dispatcher =
        SequencedDispatcher::connect(config.dispatcher.clone(), &broker, extractor, handler.clone())
            .await
            .context("Failed to connect to the broker")?;
    dispatcher.start().await.context("Failed to start the dispatcher")?;
    info!(
        "seqdispatch is consuming '{}'. Press Ctrl-C to stop.",
        dispatcher.destination()
    );

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
        _ = dispatcher.wait_for_state(seqdispatch::core::LifecycleState::ShutDown) => {
            warn!("Dispatcher shut itself down.");
        }
    }

    match dispatcher.shutdown().await {
        Ok(report) => info!(
            "Shutdown complete: {} sessions closed, {} cleanup failures, {} messages committed.",
            report.drain.closed,
            report.failure_count(),
            handler.committed()
        ),
        Err(e) => match dispatcher.failure() {
            Some(cause) => error!("Dispatcher stopped after an unrecoverable error: {}", cause),
            None => warn!("Shutdown skipped: {}", e),
        },
    }

    if config.metrics.log_on_shutdown {
        info!("Final metrics:\n{}", metrics::gather_metrics());
    }
    Ok(())
}

fn publish_demo_messages(broker: &MemoryBroker, config: &Config) {
    let destination = &config.dispatcher.destination;
    let key_name = config.key.name();
    for seq in 0..config.demo.messages {
        let key = format!("key-{}", seq % config.demo.keys);
        let body = serde_json::json!({ key_name: key, "seq": seq }).to_string();
        broker.send_body(destination, body, [(key_name, key.as_str())]);
    }
    if config.demo.messages > 0 {
        info!(
            "Published {} demo messages over {} keys to '{}'.",
            config.demo.messages, config.demo.keys, destination
        );
    }
}
