// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::Url;
use std::fmt;

use crate::errors::ConfigError;

pub const DEFAULT_SCHEME: &str = "https";
pub const DEFAULT_PATH: &str = "/api/events";
pub const API_VERSION_PARAM: &str = "api-version";
pub const DEFAULT_API_VERSION: &str = "2018-01-01";

/// Fully qualified URL events are posted to.
///
/// Built from the configured topic endpoint, which may be a bare host name: the scheme defaults
/// to `default_scheme`, the path to [`DEFAULT_PATH`] and the `api-version` query parameter to
/// [`DEFAULT_API_VERSION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEndpoint(Url);

impl TopicEndpoint {
    pub fn new(endpoint: &str, default_scheme: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let trimmed = endpoint.trim();
        if trimmed.is_empty() {
            return Err(invalid("endpoint is empty".to_string()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("{default_scheme}://{trimmed}")
        };

        let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(invalid("endpoint has no host".to_string()));
        }

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_PATH);
        }

        let has_api_version = url
            .query_pairs()
            .any(|(key, value)| key == API_VERSION_PARAM && !value.is_empty());
        if !has_api_version {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| key != API_VERSION_PARAM)
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(pairs)
                .append_pair(API_VERSION_PARAM, DEFAULT_API_VERSION);
        }

        Ok(Self(url))
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TopicEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}
