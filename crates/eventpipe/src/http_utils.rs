// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::error::Error;
use tracing::debug;

use crate::errors::ConfigError;

/// Builds the client used to ship batches, optionally routed through an HTTPS proxy.
pub fn build_client(
    https_proxy: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = https_proxy {
        debug!("Using HTTPS proxy {proxy}");
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Converts user supplied `(name, value)` pairs into a header map. Later pairs replace earlier
/// ones with the same name.
pub fn build_headers<'a, I>(headers: I) -> Result<HeaderMap, ConfigError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
        let header_value = HeaderValue::from_str(value.trim())
            .map_err(|_| ConfigError::InvalidHeader(format!("{name}: {value}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}
