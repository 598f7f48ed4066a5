// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-field value resolution.
//!
//! Every event field is configured either with a literal string, which is used as is, or with a
//! JMESPath query (a value starting with [`QUERY_PREFIX`]) that is evaluated against the JSON
//! document on the current input line.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use jmespath::{Expression, Variable};
use tracing::debug;

use crate::errors::{BuildError, ConfigError};

/// Marks a field specification as a JMESPath query rather than a literal.
pub const QUERY_PREFIX: &str = "jp:";

/// Event fields whose value is derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Subject,
    DataVersion,
    EventTime,
    EventType,
}

impl Field {
    /// Name of the field in the serialized event.
    pub const fn name(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Subject => "subject",
            Field::DataVersion => "dataVersion",
            Field::EventTime => "eventTime",
            Field::EventType => "eventType",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the value of a single field is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSpec {
    Literal(String),
    /// JMESPath expression, stored without the prefix.
    Query(String),
}

impl FieldSpec {
    /// Interprets a configuration value, recognising the query prefix.
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix(QUERY_PREFIX) {
            Some(expression) => FieldSpec::Query(expression.to_string()),
            None => FieldSpec::Literal(value.to_string()),
        }
    }
}

impl From<&str> for FieldSpec {
    fn from(value: &str) -> Self {
        FieldSpec::parse(value)
    }
}

impl Default for FieldSpec {
    fn default() -> Self {
        FieldSpec::Literal(String::new())
    }
}

/// Field specifications for every derived event field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpecs {
    /// Empty means a random identifier is generated for each event
    pub id: FieldSpec,
    pub subject: FieldSpec,
    pub data_version: FieldSpec,
    /// `now`, or milliseconds since the Unix epoch
    pub event_time: FieldSpec,
    pub event_type: FieldSpec,
}

impl Default for FieldSpecs {
    fn default() -> Self {
        Self {
            id: FieldSpec::default(),
            subject: FieldSpec::default(),
            data_version: FieldSpec::Literal("1.0".to_string()),
            event_time: FieldSpec::Literal("now".to_string()),
            event_type: FieldSpec::default(),
        }
    }
}

impl FieldSpecs {
    pub fn get(&self, field: Field) -> &FieldSpec {
        match field {
            Field::Id => &self.id,
            Field::Subject => &self.subject,
            Field::DataVersion => &self.data_version,
            Field::EventTime => &self.event_time,
            Field::EventType => &self.event_type,
        }
    }
}

/// One raw input line whose JSON form is parsed on first demand.
pub struct Line<'a> {
    raw: &'a str,
    parsed: Option<serde_json::Value>,
}

impl<'a> Line<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self { raw, parsed: None }
    }

    /// Returns the parsed document, parsing the line only the first time.
    pub fn document(&mut self) -> Result<&serde_json::Value, serde_json::Error> {
        let document = match self.parsed.take() {
            Some(document) => document,
            None => serde_json::from_str(self.raw)?,
        };
        Ok(self.parsed.insert(document))
    }
}

/// Resolves field values, compiling each query at most once for the lifetime of the resolver.
pub struct FieldResolver {
    specs: FieldSpecs,
    compiled: HashMap<Field, Expression<'static>>,
}

impl FieldResolver {
    pub fn new(specs: FieldSpecs) -> Self {
        Self {
            specs,
            compiled: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, field: Field, line: &mut Line<'_>) -> Result<String, BuildError> {
        let expression = match self.specs.get(field) {
            FieldSpec::Literal(value) => return Ok(value.clone()),
            FieldSpec::Query(expression) => expression,
        };

        let compiled = match self.compiled.entry(field) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!("Compiling query for field {field}: {expression}");
                let compiled = jmespath::compile(expression).map_err(|source| {
                    ConfigError::InvalidExpression {
                        field: field.name(),
                        source,
                    }
                })?;
                entry.insert(compiled)
            }
        };

        let document = line.document()?;
        let result = compiled
            .search(document)
            .map_err(|source| BuildError::Evaluation {
                field: field.name(),
                source,
            })?;
        Ok(stringify(&result))
    }
}

/// Renders a query result as a field value.
fn stringify(value: &Variable) -> String {
    if let Some(s) = value.as_string() {
        return s.clone();
    }
    if let Some(n) = value.as_number() {
        return format_number(n);
    }
    if let Some(b) = value.as_boolean() {
        return b.to_string();
    }
    if value.is_null() {
        return String::new();
    }
    serde_json::to_string(value).unwrap_or_default()
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}
