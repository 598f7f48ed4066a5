// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion loop: reads JSON lines, turns them into events and hands them to the publisher.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::errors::RunError;
use crate::event::EventBuilder;
use crate::flusher::Flusher;
use crate::publisher::{PublisherHandle, PublisherService};

// Matches the default token limit of common line scanners
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Lines read, including blank ones
    pub lines: usize,
    pub skipped: usize,
    /// Events handed to the publisher
    pub events: usize,
}

/// Reads `reader` line by line until end of input or until `cancel_token` is cancelled, then
/// flushes whatever is still pending.
///
/// Cancellation is only observed between lines; a line that has been read is always fully
/// processed. The first error aborts the loop and no final flush is attempted. No more than
/// `max_line_bytes` of a line is buffered before it is rejected.
pub async fn run<R>(
    reader: R,
    builder: &mut EventBuilder,
    publisher: &PublisherHandle,
    cancel_token: &CancellationToken,
    max_line_bytes: usize,
) -> Result<IngestStats, RunError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_bytes));
    let mut stats = IngestStats::default();

    loop {
        let line = tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                info!("Stop requested, no further input will be read");
                break;
            }
            line = lines.next() => line,
        };
        let Some(line) = line else {
            debug!("End of input after {} lines", stats.lines);
            break;
        };
        stats.lines += 1;
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                return Err(RunError::LineTooLong {
                    line: stats.lines,
                    limit: max_line_bytes,
                });
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            stats.skipped += 1;
            continue;
        }

        trace!("Processing line {}", stats.lines);
        let event = builder.build(&line).inspect_err(|e| {
            error!("Failed to build event from line {}: {e}", stats.lines);
        })?;
        publisher.add_event(event).await?;
        stats.events += 1;
    }

    let flushed = publisher.flush_if_needed(0).await?;
    debug!("Final flush delivered {flushed} events");
    Ok(stats)
}

/// Runs a complete pipeline for `config`: starts a publisher posting to the configured topic
/// endpoint, feeds it from `reader` and stops it once the input is done.
pub async fn publish<R>(
    config: &Config,
    reader: R,
    cancel_token: CancellationToken,
) -> Result<IngestStats, RunError>
where
    R: AsyncRead + Unpin,
{
    config.validate()?;
    let flusher = Flusher::new(config.flusher_config()?)?;
    info!("Publishing events to {}", flusher.endpoint());

    let (service, handle) = PublisherService::new(flusher, config.publisher, cancel_token.clone());
    let service_task = tokio::spawn(service.run());

    let mut builder = EventBuilder::new(config.fields.clone(), config.topic.clone());
    let result = run(
        reader,
        &mut builder,
        &handle,
        &cancel_token,
        config.max_line_bytes,
    )
    .await;

    if handle.shutdown().is_err() {
        debug!("Publisher service already stopped");
    }
    if let Err(e) = service_task.await {
        error!("Publisher service task failed: {e}");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BuildError, DeliveryError};
    use crate::event::Event;
    use crate::field::FieldSpecs;
    use crate::flusher::EventSink;
    use crate::publisher::PublisherConfig;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<Event>>>>,
    }

    /// Rejects every batch, counting delivery attempts.
    #[derive(Clone, Default)]
    struct RejectingSink {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSink for RejectingSink {
        async fn deliver(&self, _batch: &[Event]) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "unavailable".to_string(),
            })
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, batch: &[Event]) -> Result<(), DeliveryError> {
            self.batches
                .lock()
                .expect("lock poisoned")
                .push(batch.to_vec());
            Ok(())
        }
    }

    fn builder() -> EventBuilder {
        EventBuilder::new(
            FieldSpecs {
                id: "jp:id".into(),
                subject: "my subject".into(),
                event_type: "jp:type".into(),
                ..FieldSpecs::default()
            },
            None,
        )
    }

    fn publisher(sink: &RecordingSink, max_batch_size: usize) -> PublisherHandle {
        let (service, handle) = PublisherService::new(
            sink.clone(),
            PublisherConfig {
                max_batch_size,
                flush_interval: Duration::ZERO,
            },
            CancellationToken::new(),
        );
        tokio::spawn(service.run());
        handle
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let input = "{\"id\":\"a\",\"type\":\"x\"}\n\n   \n\t\n{\"id\":\"b\",\"type\":\"y\"}\n";

        let stats = run(
            input.as_bytes(),
            &mut builder(),
            &handle,
            &CancellationToken::new(),
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .expect("run failed");

        assert_eq!(
            stats,
            IngestStats {
                lines: 5,
                skipped: 3,
                events: 2
            }
        );
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<&str> = batches[0].iter().map(|e| e.id.as_str()).collect();
        let types: Vec<&str> = batches[0].iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(types, ["x", "y"]);
    }

    #[tokio::test]
    async fn test_remainder_flushed_at_end_of_input() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 2);
        let input: String = (0..5)
            .map(|n| format!("{{\"id\":\"{n}\",\"type\":\"t\"}}\n"))
            .collect();

        run(
            input.as_bytes(),
            &mut builder(),
            &handle,
            &CancellationToken::new(),
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap();

        let sizes: Vec<usize> = sink.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 2, 1]);
    }

    #[tokio::test]
    async fn test_cancelled_before_reading() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let stats = run(
            "{\"id\":\"a\",\"type\":\"x\"}\n".as_bytes(),
            &mut builder(),
            &handle,
            &cancel_token,
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap();

        assert_eq!(stats.events, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_after_current_line() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let cancel_token = CancellationToken::new();

        let (mut writer, reader) = tokio::io::duplex(1024);
        let input_token = cancel_token.clone();
        tokio::spawn(async move {
            writer
                .write_all(b"{\"id\":\"a\",\"type\":\"x\"}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            input_token.cancel();
            // keep the writer open so only cancellation can end the loop
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(writer);
        });

        let stats = run(
            reader,
            &mut builder(),
            &handle,
            &cancel_token,
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap();

        assert_eq!(stats.events, 1);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_error_aborts_without_final_flush() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let input = "{\"id\":\"a\",\"type\":\"x\"}\nnot json\n{\"id\":\"c\",\"type\":\"z\"}\n";

        let err = run(
            input.as_bytes(),
            &mut builder(),
            &handle,
            &CancellationToken::new(),
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Build(BuildError::Parse(_))));
        assert!(sink.batches.lock().unwrap().is_empty());
        assert_eq!(handle.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let input = format!("{{\"id\":\"{}\",\"type\":\"x\"}}\n", "a".repeat(100));

        let err = run(
            input.as_bytes(),
            &mut builder(),
            &handle,
            &CancellationToken::new(),
            64,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RunError::LineTooLong {
                line: 1,
                limit: 64,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_input_error() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);
        let input: &[u8] = b"{\"id\":\"\xff\"}\n";

        let err = run(
            input,
            &mut builder(),
            &handle,
            &CancellationToken::new(),
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Input(_)));
    }

    #[tokio::test]
    async fn test_unterminated_input_is_bounded() {
        let sink = RecordingSink::default();
        let handle = publisher(&sink, 10);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(
                tokio::io::repeat(b'a'),
                &mut builder(),
                &handle,
                &CancellationToken::new(),
                1024,
            ),
        )
        .await
        .expect("reading an endless line was not cut off");

        assert!(matches!(
            result,
            Err(RunError::LineTooLong {
                line: 1,
                limit: 1024
            })
        ));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_failure_stops_ingestion() {
        let sink = RejectingSink::default();
        let cancel_token = CancellationToken::new();
        let (service, handle) = PublisherService::new(
            sink.clone(),
            PublisherConfig {
                max_batch_size: 10,
                flush_interval: Duration::from_millis(100),
            },
            cancel_token.clone(),
        );
        let service_task = tokio::spawn(service.run());

        let (mut writer, reader) = tokio::io::duplex(1024);
        writer
            .write_all(b"{\"id\":\"a\",\"type\":\"x\"}\n")
            .await
            .unwrap();
        // a second line arrives long after the timer fired; the input stays open
        let writer_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            writer
                .write_all(b"{\"id\":\"b\",\"type\":\"y\"}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(writer);
        });

        let start = Instant::now();
        let err = run(
            reader,
            &mut builder(),
            &handle,
            &cancel_token,
            DEFAULT_MAX_LINE_BYTES,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RunError::Delivery(DeliveryError::Status { status, .. })
                if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(cancel_token.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);

        service_task.await.expect("service task failed");
        writer_task.abort();
    }
}
