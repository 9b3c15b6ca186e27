//! Per-container log follower
//!
//! A monitor opens a follow-mode log stream, splits it into lines and
//! publishes them to the shared event queue. Clean end-of-stream reconnects;
//! any stream error ends the monitor.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::AsyncReadExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use podtail_types::{Event, EventSource};

use crate::backoff::Backoff;
use crate::buffer::LineBuffer;
use crate::source::{LogOptions, LogReader, LogSource};

/// Settings shared by every monitor
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Lookback for the first stream of a monitor
    pub since_seconds: i64,
    /// Lookback when reopening after the stream ended
    pub reconnect_since_seconds: i64,
    /// Ask for timestamp-prefixed lines
    pub timestamps: bool,
    /// Read size per stream read
    pub chunk_size: usize,
    /// Delay bounds between reconnects of streams that end without data
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            since_seconds: 1,
            reconnect_since_seconds: 1,
            timestamps: false,
            chunk_size: 1024,
            backoff_min: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to open log stream: {0}")]
    Open(#[source] io::Error),

    #[error("failed to read log stream: {0}")]
    Read(#[source] io::Error),
}

/// How one stream ended without error
enum StreamEnd {
    Cancelled,
    QueueClosed,
    Eof { received: bool },
}

pub(crate) struct Monitor<L> {
    source: EventSource,
    logs: L,
    events: mpsc::Sender<Event>,
    config: Arc<MonitorConfig>,
}

impl<L: LogSource> Monitor<L> {
    pub(crate) fn new(
        source: EventSource,
        logs: L,
        events: mpsc::Sender<Event>,
        config: Arc<MonitorConfig>,
    ) -> Self {
        Self {
            source,
            logs,
            events,
            config,
        }
    }

    /// Follow the log until cancelled, the queue closes or the stream fails
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), MonitorError> {
        let mut buffer = LineBuffer::new(self.source.clone());
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let mut since = self.config.since_seconds;

        loop {
            let options = LogOptions {
                since_seconds: Some(since),
                timestamps: self.config.timestamps,
            };
            let reader = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                opened = self.logs.open(&self.source, options) => opened.map_err(MonitorError::Open)?,
            };
            tracing::debug!(since, "log stream opened");
            since = self.config.reconnect_since_seconds;

            match self.follow(reader, &mut buffer, &mut chunk, &cancel).await? {
                StreamEnd::Cancelled => return Ok(()),
                StreamEnd::QueueClosed => {
                    tracing::debug!("event queue closed");
                    return Ok(());
                }
                StreamEnd::Eof { received: true } => {
                    backoff.reset();
                    tracing::debug!("log stream ended, reconnecting");
                }
                StreamEnd::Eof { received: false } => {
                    let delay = backoff.next_delay();
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "empty log stream, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn follow(
        &self,
        mut reader: LogReader,
        buffer: &mut LineBuffer,
        chunk: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, MonitorError> {
        let mut received = false;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                read = reader.read(chunk) => read.map_err(MonitorError::Read)?,
            };
            if n == 0 {
                return Ok(StreamEnd::Eof { received });
            }
            received = true;

            let mut dropped = 0usize;
            for event in buffer.process(&chunk[..n]) {
                match self.events.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Closed(_)) => return Ok(StreamEnd::QueueClosed),
                }
            }
            if dropped > 0 {
                tracing::warn!(dropped, "event queue full, dropping lines");
            }
        }
    }
}

/// Reports a monitor's source once its task ends, however it ends
struct Completion {
    source: Option<EventSource>,
    tx: mpsc::UnboundedSender<EventSource>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            let _ = self.tx.send(source);
        }
    }
}

/// Run `monitor` as a tracked task inside its own span
pub(crate) fn spawn<L: LogSource>(
    monitor: Monitor<L>,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<EventSource>,
    tracker: &TaskTracker,
) {
    let source = monitor.source.clone();
    let span = tracing::info_span!(
        "monitor",
        namespace = %source.namespace(),
        pod = %source.name(),
        container = %source.container(),
    );

    tracker.spawn(
        async move {
            let _completion = Completion {
                source: Some(source),
                tx: completions,
            };
            match monitor.run(cancel).await {
                Ok(()) => tracing::debug!("monitor stopped"),
                Err(e) => tracing::warn!(error = %e, "monitor stopped"),
            }
        }
        .instrument(span),
    );
}
