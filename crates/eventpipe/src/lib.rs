// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publishes newline-delimited JSON records to an Event Grid topic.
//!
//! Each input line becomes one event whose fields are either literals or JMESPath queries over
//! the line ([`field`]). Events are accumulated by the batching publisher ([`publisher`]) and
//! posted as JSON arrays ([`flusher`]) once a batch is full, when the flush interval elapses,
//! and a final time when the input ends ([`ingest`]).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod endpoint;
pub mod errors;
pub mod event;
pub mod field;
pub mod flusher;
pub mod http_utils;
pub mod ingest;
pub mod publisher;
