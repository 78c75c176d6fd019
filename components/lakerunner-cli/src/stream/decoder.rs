//! StreamDecoder - responsibility and behavior
//!
//! Turns the body of a query response, framed as newline delimited
//! Server-Sent-Events (`data: <json>\n`), into a lazy sequence of [`LogsEvent`]s.
//!
//! The sequence ends when:
//! - the body reaches end-of-file,
//! - a line carries the `{"type":"done"}` sentinel,
//! - the cancellation token fires,
//! - the consumer drops its [`EventStream`].
//!
//! A read failure other than EOF also ends the sequence, after one terminal
//! [`DecodeError::Read`] item has been handed to the consumer. Malformed
//! `data: ` lines are skipped and never end the sequence.
//!
//! The decoding task owns the byte stream and drops it on every exit path
//! before the channel closes, so a consumer that observes the end of the
//! sequence can rely on the underlying connection being released.

// Local crates
use crate::stream::models::LogsEvent;

// External crates
use futures::Stream;
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Prefix of the only SSE field this decoder interprets.
pub const DATA_PREFIX: &str = "data: ";

/// Payload the service sends to mark the intentional end of a stream.
pub const DONE_SENTINEL: &str = r#"{"type":"done"}"#;

const READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Item type yielded by an [`EventStream`].
pub type DecodeResult = Result<LogsEvent, DecodeError>;

/// Terminal failure of a decoding task.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read event stream: {0}")]
    Read(#[from] std::io::Error),
}

/// What a single line of the wire format means to the decoder.
#[derive(Debug)]
pub enum LineOutcome {
    /// Blank line or an SSE field other than `data`.
    Ignored,
    /// The end-of-stream sentinel.
    Done,
    Event(LogsEvent),
    /// A `data: ` line whose remainder is not a valid event.
    Malformed(serde_json::Error),
}

/// Classify one line read from the wire. Surrounding whitespace, including a
/// trailing `\r`, is ignored.
pub fn classify_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Ignored;
    }

    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };

    if data == DONE_SENTINEL {
        return LineOutcome::Done;
    }

    match LogsEvent::from_json(data) {
        Ok(event) => LineOutcome::Event(event),
        Err(e) => LineOutcome::Malformed(e),
    }
}

/// Why a decoding task stopped.
#[derive(Debug)]
enum Termination {
    EndOfStream,
    Sentinel,
    Cancelled,
    ConsumerGone,
    ReadFailed(std::io::Error),
}

/// Decoder for a single response body. Not restartable: [`StreamDecoder::spawn`]
/// consumes it.
#[derive(Debug)]
pub struct StreamDecoder<R> {
    reader: R,
    cancel: CancellationToken,
    capacity: usize,
}

impl<R> StreamDecoder<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Create a decoder over `reader`. Cancelling `parent_cancel` stops the
    /// decoder at the next line boundary.
    pub fn new(reader: R, parent_cancel: &CancellationToken) -> Self {
        Self {
            reader,
            cancel: parent_cancel.child_token(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Number of decoded events that may wait for the consumer before the
    /// decoder pauses reading.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Spawn the decoding task on the current tokio runtime and return the
    /// consumer side of the sequence.
    #[instrument(
        name = "lakerunner_stream::spawn",
        target = "stream::decoder",
        skip_all,
        level = "debug"
    )]
    pub fn spawn(self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);

        tracing::debug!(
            channel_capacity = self.capacity,
            "Spawning event stream decoding task"
        );
        tokio::spawn(run_decoder(self.reader, self.cancel.clone(), tx));

        EventStream {
            inner: ReceiverStream::new(rx),
            cancel: self.cancel,
        }
    }
}

/// Background task body. `reader` is moved into `decode_lines` and dropped
/// when it returns, before `tx` goes away.
#[instrument(
    name = "lakerunner_stream::run_decoder",
    target = "stream::decoder",
    skip_all,
    level = "debug"
)]
async fn run_decoder<R>(reader: R, cancel: CancellationToken, tx: mpsc::Sender<DecodeResult>)
where
    R: AsyncRead + Unpin,
{
    let termination = decode_lines(reader, &cancel, &tx).await;

    match termination {
        Termination::ReadFailed(e) => {
            tracing::warn!(error = %e, "Event stream read failed, ending stream");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tx.send(Err(DecodeError::Read(e))) => {}
            }
        }
        Termination::EndOfStream => {
            tracing::debug!("Event stream reached end of file");
        }
        Termination::Sentinel => {
            tracing::debug!("Event stream done sentinel received");
        }
        Termination::Cancelled => {
            tracing::debug!("Event stream decoding cancelled");
        }
        Termination::ConsumerGone => {
            tracing::debug!("Event stream consumer dropped, stopping decoder");
        }
    }
}

async fn decode_lines<R>(
    reader: R,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<DecodeResult>,
) -> Termination
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);
    let mut buf = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut emitted: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        buf.clear();

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Termination::Cancelled,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => return Termination::EndOfStream,
            Ok(_) if buf.last() != Some(&b'\n') => {
                // EOF in the middle of a line: the fragment is never decoded.
                tracing::debug!(
                    fragment_len = buf.len(),
                    "Discarding unterminated trailing line"
                );
                return Termination::EndOfStream;
            }
            Ok(_) => {}
            Err(e) => return Termination::ReadFailed(e),
        }

        let line = String::from_utf8_lossy(&buf);

        let event = match classify_line(&line) {
            LineOutcome::Ignored => continue,
            LineOutcome::Done => {
                tracing::trace!(emitted, skipped, "Sentinel line decoded");
                return Termination::Sentinel;
            }
            LineOutcome::Malformed(e) => {
                skipped += 1;
                tracing::debug!(error = %e, line = %line.trim(), "Skipping malformed event line");
                continue;
            }
            LineOutcome::Event(event) => event,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Termination::Cancelled,
            sent = tx.send(Ok(event)) => {
                if sent.is_err() {
                    return Termination::ConsumerGone;
                }
                emitted += 1;
            }
        }
    }
}

/// Consumer side of a decoding task.
///
/// Yields events in wire order. Dropping the stream cancels its decoder.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct EventStream {
    #[pin]
    inner: ReceiverStream<DecodeResult>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Ask the decoder to stop at the next line boundary. Events already in
    /// the channel can still be received.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = DecodeResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for EventStream {
    fn drop(self: Pin<&mut Self>) {
        self.cancel.cancel();
    }
}
