// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::endpoint::{TopicEndpoint, DEFAULT_SCHEME};
use crate::errors::ConfigError;
use crate::field::{FieldSpec, FieldSpecs};
use crate::flusher::FlusherConfig;
use crate::http_utils::build_headers;
use crate::ingest::DEFAULT_MAX_LINE_BYTES;
use crate::publisher::PublisherConfig;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to turn an input stream into published events.
#[derive(Debug, Clone)]
pub struct Config {
    /// Topic endpoint, either a full URL or a bare host name
    pub topic_endpoint: String,
    /// Scheme used when `topic_endpoint` has none
    pub default_scheme: String,
    /// Extra request headers (e.g. `aeg-sas-key`)
    pub headers: Vec<(String, String)>,
    pub fields: FieldSpecs,
    /// Literal `topic` for every event, if set
    pub topic: Option<String>,
    pub publisher: PublisherConfig,
    /// Timeout for each delivery request
    pub request_timeout: Duration,
    pub https_proxy: Option<String>,
    /// Longest accepted input line, in bytes
    pub max_line_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic_endpoint: String::new(),
            default_scheme: DEFAULT_SCHEME.to_string(),
            headers: Vec::new(),
            fields: FieldSpecs::default(),
            topic: None,
            publisher: PublisherConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            https_proxy: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "topic endpoint cannot be empty".to_string(),
            ));
        }

        if self.default_scheme != "http" && self.default_scheme != "https" {
            return Err(ConfigError::InvalidValue(format!(
                "Invalid scheme '{}'. Must be one of: http, https",
                self.default_scheme
            )));
        }

        if self.fields.subject == FieldSpec::default() {
            return Err(ConfigError::InvalidValue(
                "subject must be set".to_string(),
            ));
        }
        if self.fields.event_type == FieldSpec::default() {
            return Err(ConfigError::InvalidValue(
                "event type must be set".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_line_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "max line size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn endpoint(&self) -> Result<TopicEndpoint, ConfigError> {
        TopicEndpoint::new(&self.topic_endpoint, &self.default_scheme)
    }

    pub fn flusher_config(&self) -> Result<FlusherConfig, ConfigError> {
        let headers = build_headers(
            self.headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )?;
        Ok(FlusherConfig {
            endpoint: self.endpoint()?,
            headers,
            https_proxy: self.https_proxy.clone(),
            timeout: self.request_timeout,
        })
    }
}
