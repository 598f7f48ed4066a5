// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the pipeline.

use reqwest::StatusCode;

/// Problems with the configuration, detected at startup or on first use.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid topic endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid query expression for field '{field}': {source}")]
    InvalidExpression {
        field: &'static str,
        #[source]
        source: jmespath::JmespathError,
    },

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),

    #[error("Unable to create HTTP client: {0}")]
    HttpClient(String),
}

/// Failures while turning one input line into an event.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Line is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to evaluate query for field '{field}': {source}")]
    Evaluation {
        field: &'static str,
        #[source]
        source: jmespath::JmespathError,
    },

    #[error("Invalid timestamp '{0}': expected \"now\" or milliseconds since the Unix epoch")]
    InvalidTimestamp(String),
}

/// Failures while shipping a batch to the topic endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to serialize batch: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Error sending batch: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{status}: topic endpoint rejected batch: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Publisher service is not running")]
    ServiceStopped,
}

/// Errors surfaced by the ingestion loop.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Failed to read input: {0}")]
    Input(#[from] std::io::Error),

    #[error("Input line {line} exceeds the limit of {limit} bytes")]
    LineTooLong { line: usize, limit: usize },
}
