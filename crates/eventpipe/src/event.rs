// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event Grid events and how they are built from input lines.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::errors::BuildError;
use crate::field::{Field, FieldResolver, FieldSpecs, Line};

/// Timestamp specification value meaning "the time the line was read".
pub const NOW: &str = "now";

/// An event published to an Event Grid topic using the Event Grid schema.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier for the event.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Resource path of the event source.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// Resource path relative to the topic path.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject: String,
    /// The input line, embedded verbatim.
    pub data: RawJson,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    /// UTC, RFC3339 with up to nanosecond precision.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_time: String,
    /// Schema version of the data object.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data_version: String,
}

/// A JSON document kept exactly as it was read, including any surrounding whitespace.
///
/// Serialized as raw JSON; whitespace around the value is insignificant there and is left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawJson(String);

impl RawJson {
    pub fn new(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<&RawValue>(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Serialize for RawJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: &RawValue =
            serde_json::from_str(&self.0).map_err(<S::Error as serde::ser::Error>::custom)?;
        value.serialize(serializer)
    }
}

/// Builds events from raw input lines.
pub struct EventBuilder {
    resolver: FieldResolver,
    topic: String,
}

impl EventBuilder {
    pub fn new(specs: FieldSpecs, topic: Option<String>) -> Self {
        Self {
            resolver: FieldResolver::new(specs),
            topic: topic.unwrap_or_default(),
        }
    }

    pub fn build(&mut self, raw: &str) -> Result<Event, BuildError> {
        let mut line = Line::new(raw);

        let mut id = self.resolver.resolve(Field::Id, &mut line)?;
        if id.is_empty() {
            id = Uuid::new_v4().to_string();
        }
        let subject = self.resolver.resolve(Field::Subject, &mut line)?;
        let data_version = self.resolver.resolve(Field::DataVersion, &mut line)?;
        let event_time = self.event_time(&mut line)?;
        let event_type = self.resolver.resolve(Field::EventType, &mut line)?;
        let data = RawJson::new(raw)?;

        Ok(Event {
            id,
            topic: self.topic.clone(),
            subject,
            data,
            event_type,
            event_time,
            data_version,
        })
    }

    fn event_time(&mut self, line: &mut Line<'_>) -> Result<String, BuildError> {
        let value = self.resolver.resolve(Field::EventTime, line)?;
        if value == NOW {
            return Ok(format_rfc3339_nanos(&Utc::now()));
        }
        let millis: i64 = value
            .parse()
            .map_err(|_| BuildError::InvalidTimestamp(value.clone()))?;
        let time = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| BuildError::InvalidTimestamp(value.clone()))?;
        Ok(format_rfc3339_nanos(&time))
    }
}

/// Formats a UTC timestamp as RFC3339 with nanoseconds, dropping trailing zeros from the
/// fractional second and the fraction entirely when it is zero.
pub fn format_rfc3339_nanos(time: &DateTime<Utc>) -> String {
    let mut formatted = time.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = time.timestamp_subsec_nanos();
    if nanos != 0 {
        let fraction = format!("{nanos:09}");
        formatted.push('.');
        formatted.push_str(fraction.trim_end_matches('0'));
    }
    formatted.push('Z');
    formatted
}
