// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::{env, future, process::ExitCode, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use eventpipe::{
    config::Config,
    endpoint::DEFAULT_SCHEME,
    field::{FieldSpec, FieldSpecs},
    ingest::{self, DEFAULT_MAX_LINE_BYTES},
    publisher::{PublisherConfig, DEFAULT_MAX_BATCH_SIZE},
};

/// Reads JSON lines from stdin and publishes them as events to an Event Grid topic.
///
/// Field values starting with "jp:" are JMESPath queries evaluated against each line; anything
/// else is used literally.
#[derive(Parser, Debug)]
#[command(name = "eventpipe", version)]
struct Cli {
    /// Topic endpoint, e.g. mytopic.westus2-1.eventgrid.azure.net
    topic_endpoint: String,

    /// Extra request header as KEY=VALUE; may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Event id; a random UUID is used when empty
    #[arg(short, long, default_value = "")]
    id: String,

    #[arg(short, long)]
    subject: String,

    #[arg(short = 't', long = "type")]
    event_type: String,

    /// "now" or milliseconds since the Unix epoch
    #[arg(short = 'T', long = "timestamp", default_value = "now")]
    event_time: String,

    #[arg(long, default_value = "1.0")]
    data_version: String,

    /// Literal topic set on every event
    #[arg(long)]
    topic: Option<String>,

    /// Number of events that triggers a flush; 0 flushes on the interval only
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    queue_size: usize,

    /// Milliseconds between queue flushes; 0 disables timed flushes
    #[arg(long, default_value_t = 2000)]
    flush_interval: u64,

    /// Scheme used when the topic endpoint has none
    #[arg(long, default_value = DEFAULT_SCHEME)]
    scheme: String,

    /// Timeout for each publish request, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Longest accepted input line, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    max_line_bytes: usize,

    #[arg(long, env = "HTTPS_PROXY")]
    https_proxy: Option<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            topic_endpoint: self.topic_endpoint,
            default_scheme: self.scheme,
            headers: self.headers,
            fields: FieldSpecs {
                id: FieldSpec::parse(&self.id),
                subject: FieldSpec::parse(&self.subject),
                data_version: FieldSpec::parse(&self.data_version),
                event_time: FieldSpec::parse(&self.event_time),
                event_type: FieldSpec::parse(&self.event_type),
            },
            topic: self.topic,
            publisher: PublisherConfig {
                max_batch_size: self.queue_size,
                flush_interval: Duration::from_millis(self.flush_interval),
            },
            request_timeout: Duration::from_millis(self.timeout_ms),
            https_proxy: self.https_proxy,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = env::var("EVENTPIPE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("eventpipe: error: unable to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cli.into_config()));
    // A pending stdin read occupies a blocking thread that never returns on its own
    runtime.shutdown_background();
    code
}

async fn run(config: Config) -> ExitCode {
    let cancel_token = CancellationToken::new();
    tokio::spawn(wait_for_signal(cancel_token.clone()));

    match ingest::publish(&config, tokio::io::stdin(), cancel_token).await {
        Ok(stats) => {
            info!(
                "Published {} events from {} lines ({} blank)",
                stats.events, stats.lines, stats.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Publishing stopped: {e}");
            eprintln!("eventpipe: error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Cancels `cancel_token` on SIGINT or SIGTERM. The ingestion loop finishes the line it is
/// working on, stops reading and flushes.
async fn wait_for_signal(cancel_token: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received Ctrl+C, stopping after the current line"),
        () = terminate => info!("Received SIGTERM, stopping after the current line"),
        () = cancel_token.cancelled() => return,
    }
    cancel_token.cancel();
}
