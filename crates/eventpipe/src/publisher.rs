// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching publisher.
//!
//! [`PublisherService`] exclusively owns the pending batch, the sink and the flush timer. Callers
//! talk to it through a cheap, cloneable [`PublisherHandle`]; every command is processed in
//! order, so two flushes never overlap and each flush observes a consistent batch. A slow
//! delivery therefore stalls both new events and timer ticks until it completes.
//!
//! Delivery is attempted exactly once. A failed batch is dropped, not requeued: events are
//! delivered at most once.

use std::future;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::DeliveryError;
use crate::event::Event;
use crate::flusher::EventSink;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Number of pending events that triggers a flush from `add_event`. Zero leaves the batch
    /// unbounded, so only the timer and explicit flushes deliver it.
    pub max_batch_size: usize,
    /// Time between timer driven flushes. Zero disables the timer.
    pub flush_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, DeliveryError>>;

#[derive(Debug)]
pub enum PublisherCommand {
    AddEvent(Event, Reply<()>),
    FlushIfNeeded(usize, Reply<usize>),
    Flush(Reply<usize>),
    Pending(oneshot::Sender<usize>),
    Shutdown,
}

impl PublisherCommand {
    /// Answers the command with `error` instead of executing it. Returns the error back for
    /// commands that cannot carry one.
    fn fail(self, error: DeliveryError) -> Option<DeliveryError> {
        let sent = match self {
            PublisherCommand::AddEvent(_, reply) => reply.send(Err(error)).is_ok(),
            PublisherCommand::FlushIfNeeded(_, reply) | PublisherCommand::Flush(reply) => {
                reply.send(Err(error)).is_ok()
            }
            PublisherCommand::Pending(_) | PublisherCommand::Shutdown => return Some(error),
        };
        if !sent {
            error!("Unable to report failed delivery - receiver dropped");
        }
        None
    }
}

#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<PublisherCommand>,
}

impl PublisherHandle {
    /// Appends an event, flushing synchronously when the batch reaches the size threshold.
    pub async fn add_event(&self, event: Event) -> Result<(), DeliveryError> {
        self.request(|reply| PublisherCommand::AddEvent(event, reply))
            .await
    }

    /// Delivers the pending batch if it holds at least `threshold` events. A threshold of 0
    /// flushes whatever is pending. Returns the number of delivered events.
    pub async fn flush_if_needed(&self, threshold: usize) -> Result<usize, DeliveryError> {
        self.request(|reply| PublisherCommand::FlushIfNeeded(threshold, reply))
            .await
    }

    /// Delivers the pending batch regardless of its size. Returns the number of delivered events.
    pub async fn flush(&self) -> Result<usize, DeliveryError> {
        self.request(PublisherCommand::Flush).await
    }

    pub async fn pending(&self) -> Result<usize, DeliveryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PublisherCommand::Pending(response_tx))
            .map_err(|_| DeliveryError::ServiceStopped)?;
        response_rx.await.map_err(|_| DeliveryError::ServiceStopped)
    }

    /// Stops the service. Events still pending are dropped.
    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<PublisherCommand>> {
        self.tx.send(PublisherCommand::Shutdown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> PublisherCommand,
    ) -> Result<T, DeliveryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(command(response_tx))
            .map_err(|_| DeliveryError::ServiceStopped)?;
        response_rx
            .await
            .map_err(|_| DeliveryError::ServiceStopped)?
    }
}

pub struct PublisherService {
    sink: Box<dyn EventSink>,
    config: PublisherConfig,
    pending: Vec<Event>,
    rx: mpsc::UnboundedReceiver<PublisherCommand>,
    cancel_token: CancellationToken,
    failure: Option<DeliveryError>,
}

impl PublisherService {
    /// `cancel_token` is cancelled when a timer driven flush fails, so that producers stop.
    pub fn new<S>(
        sink: S,
        config: PublisherConfig,
        cancel_token: CancellationToken,
    ) -> (Self, PublisherHandle)
    where
        S: EventSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            sink: Box::new(sink),
            config,
            pending: Vec::new(),
            rx,
            cancel_token,
            failure: None,
        };

        let handle = PublisherHandle { tx };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!(
            "Publisher service started (max batch size {}, flush interval {:?})",
            self.config.max_batch_size, self.config.flush_interval
        );
        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("All publisher handles dropped");
                        break;
                    };
                    if !self.handle_command(command, ticker.as_mut()).await {
                        break;
                    }
                }
                () = next_tick(ticker.as_mut()) => {
                    if let Err(e) = self.flush_if_needed(0).await {
                        error!("Time-triggered flush failed, stopping publisher: {e}");
                        self.failure = Some(e);
                        self.cancel_token.cancel();
                        ticker = None;
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            warn!(
                "Publisher stopped with {} undelivered events",
                self.pending.len()
            );
        }
        debug!("Publisher service stopped");
    }

    /// Returns false once the service must stop.
    async fn handle_command(
        &mut self,
        command: PublisherCommand,
        ticker: Option<&mut Interval>,
    ) -> bool {
        let command = match (self.failure.take(), command) {
            (None, command) => command,
            (Some(failure), command @ PublisherCommand::Pending(_)) => {
                // kept for the next command that can report it
                self.failure = Some(failure);
                command
            }
            (Some(failure), command) => {
                self.failure = command.fail(failure);
                return false;
            }
        };

        match command {
            PublisherCommand::AddEvent(event, reply) => {
                self.pending.push(event);
                if self.pending.len() == 1 {
                    // A fresh batch always gets a full interval before the timer flushes it
                    if let Some(ticker) = ticker {
                        ticker.reset();
                    }
                }
                let result = match self.config.max_batch_size {
                    0 => Ok(()),
                    max => self.flush_if_needed(max).await.map(|_| ()),
                };
                respond(reply, result);
            }
            PublisherCommand::FlushIfNeeded(threshold, reply) => {
                let result = self.flush_if_needed(threshold).await;
                respond(reply, result);
            }
            PublisherCommand::Flush(reply) => {
                let result = self.flush().await;
                respond(reply, result);
            }
            PublisherCommand::Pending(reply) => {
                if reply.send(self.pending.len()).is_err() {
                    error!("Failed to send pending response - receiver dropped");
                }
            }
            PublisherCommand::Shutdown => {
                debug!("Publisher service shutting down");
                return false;
            }
        }
        true
    }

    async fn flush_if_needed(&mut self, threshold: usize) -> Result<usize, DeliveryError> {
        if self.pending.is_empty() || self.pending.len() < threshold {
            return Ok(0);
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<usize, DeliveryError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let n_events = self.pending.len();
        let result = self.sink.deliver(&self.pending).await;
        self.pending.clear();

        match result {
            Ok(()) => {
                debug!("Flushed {n_events} events");
                Ok(n_events)
            }
            Err(e) => {
                warn!("Dropping {n_events} events after failed delivery");
                Err(e)
            }
        }
    }

    fn ticker(&self) -> Option<Interval> {
        let period = self.config.flush_interval;
        if period.is_zero() {
            return None;
        }
        // skip the immediate first tick
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, DeliveryError>) {
    if reply.send(result).is_err() {
        error!("Failed to send publisher response - receiver dropped");
    }
}
