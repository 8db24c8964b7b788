//! Hub notification stream with auto-reconnect.
//!
//! Hubs expose a long-poll endpoint (`GET /not.byn?abs=<pos>`) that pushes
//! device/function change events as newline-delimited text, each batch
//! terminated by an absolute position marker (`...\n@<decimal>`). This
//! module parses that stream and fans events out through a
//! [`tokio::sync::broadcast`] channel, reconnecting with exponential
//! backoff + jitter automatically.
//!
//! # Example
//!
//! ```rust,ignore
//! use yhub_api::notification::{NotificationStream, ReconnectConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let stream = NotificationStream::open(client, notify_url, ReconnectConfig::default(), cancel.clone());
//! let mut rx = stream.subscribe();
//!
//! while let Ok(event) = rx.recv().await {
//!     println!("{event:?}");
//! }
//!
//! stream.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Constants ────────────────────────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum tolerated forward jump of the notification cursor.
///
/// A new position beyond `current + threshold` (or behind `current`) means
/// the hub restarted; the stream replays from zero rather than resuming.
/// The value matches the hub firmware's flush window; treat it as a
/// tunable, not a protocol guarantee.
pub const CURSOR_JUMP_THRESHOLD: u64 = 65536;

// ── HubEvent ─────────────────────────────────────────────────────────

/// A parsed event from the hub notification stream.
///
/// Unknown line shapes are preserved as [`HubEvent::Log`] so nothing from
/// the hub is silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A device appeared behind the hub (`+<serial>`).
    DeviceArrival { serial: String },
    /// A device left the hub (`-<serial>`).
    DeviceRemoval { serial: String },
    /// A function published a new advertised value
    /// (`<serial>,<functionId>,<value>`).
    FunctionValue {
        serial: String,
        function_id: String,
        value: String,
    },
    /// Anything else: hub log output, forwarded verbatim.
    Log { line: String },
}

impl HubEvent {
    /// Decode one notification line.
    pub fn parse(line: &str) -> Self {
        if let Some(serial) = line.strip_prefix('+') {
            return Self::DeviceArrival {
                serial: serial.to_owned(),
            };
        }
        if let Some(serial) = line.strip_prefix('-') {
            return Self::DeviceRemoval {
                serial: serial.to_owned(),
            };
        }

        let mut parts = line.splitn(3, ',');
        if let (Some(serial), Some(function_id), Some(value)) =
            (parts.next(), parts.next(), parts.next())
        {
            if !serial.is_empty() && !function_id.is_empty() {
                return Self::FunctionValue {
                    serial: serial.to_owned(),
                    function_id: function_id.to_owned(),
                    value: value.to_owned(),
                };
            }
        }

        Self::Log {
            line: line.to_owned(),
        }
    }
}

// ── Batch parsing ────────────────────────────────────────────────────

/// One decoded notification batch: ordered events plus the new absolute
/// stream position.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedBatch {
    pub events: Vec<HubEvent>,
    pub position: u64,
}

/// Split a `...\n@<decimal>` terminated text into its line part and the
/// new absolute position. Also used for device log tails (`logs.txt`),
/// which carry the same trailing marker.
///
/// Returns `None` when the marker is absent or unreadable -- a transient
/// decode failure: no cursor update, nothing emitted.
pub fn split_position_marker(text: &str) -> Option<(&str, u64)> {
    let (body, marker) = match text.rfind("\n@") {
        Some(idx) => (&text[..idx], &text[idx + 2..]),
        // A batch may consist of the marker alone.
        None => text.strip_prefix('@').map(|m| ("", m))?,
    };

    let position = marker.trim_end().parse().ok()?;
    Some((body, position))
}

/// Parse a notification batch ending in a `...\n@<decimal>` marker.
pub fn parse_batch(text: &str) -> Option<ParsedBatch> {
    let (body, position) = split_position_marker(text)?;
    let events = body
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(HubEvent::parse)
        .collect();

    Some(ParsedBatch { events, position })
}

// ── Cursor ───────────────────────────────────────────────────────────

/// What a cursor did with an observed position marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAction {
    /// Normal forward progress; resume from the new position.
    Advanced,
    /// Regression or an implausible jump: hub restarted, replay from zero.
    Reset,
}

/// Absolute position in a hub's notification stream.
///
/// Used to resume the long-poll without re-reading already-seen events.
/// Delivery is at-least-once: after a reset, replay from zero is expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationCursor {
    position: Option<u64>,
}

impl NotificationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current resume position; `None` until the first marker is seen.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Apply an observed position marker.
    ///
    /// The first marker is accepted wherever it lands. Afterwards, a
    /// regression or a forward jump beyond [`CURSOR_JUMP_THRESHOLD`]
    /// resets the position to zero (hub restart) instead of erroring.
    pub fn observe(&mut self, new_pos: u64) -> CursorAction {
        match self.position {
            Some(current) if new_pos < current || new_pos > current + CURSOR_JUMP_THRESHOLD => {
                tracing::info!(current, new_pos, "notification cursor reset (hub restart?)");
                self.position = Some(0);
                CursorAction::Reset
            }
            _ => {
                self.position = Some(new_pos);
                CursorAction::Advanced
            }
        }
    }
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for stream reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── NotificationStream ───────────────────────────────────────────────

/// Handle to a running notification long-poll.
///
/// Events for a hub are delivered in stream order. Drop all receivers and
/// call [`shutdown`](Self::shutdown) to tear down the background task.
pub struct NotificationStream {
    event_rx: broadcast::Receiver<Arc<HubEvent>>,
    cancel: CancellationToken,
}

impl NotificationStream {
    /// Spawn the long-poll loop against a hub's notification endpoint.
    ///
    /// Returns immediately; the first poll happens asynchronously.
    /// Subscribe to the event receiver to start consuming events.
    pub fn open(
        http: reqwest::Client,
        notify_url: Url,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            poll_loop(http, notify_url, event_tx, reconnect, task_cancel).await;
        });

        Self { event_rx, cancel }
    }

    /// Get a new broadcast receiver for the event stream.
    ///
    /// Multiple consumers can subscribe concurrently. If a consumer falls
    /// behind, it receives [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HubEvent>> {
        self.event_rx.resubscribe()
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background poll loop ─────────────────────────────────────────────

/// Main loop: poll → read batches → on error, backoff → re-poll.
async fn poll_loop(
    http: reqwest::Client,
    notify_url: Url,
    event_tx: broadcast::Sender<Arc<HubEvent>>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut cursor = NotificationCursor::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = poll_once(&http, &notify_url, &mut cursor, &event_tx, &cancel) => {
                match result {
                    // Hub closed the poll cleanly; re-poll from the cursor.
                    Ok(()) => {
                        tracing::debug!("notification poll ended, resuming");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "notification poll error");

                        if let Some(max) = reconnect.max_retries {
                            if attempt >= max {
                                tracing::error!(
                                    max_retries = max,
                                    "notification reconnection limit reached, giving up"
                                );
                                break;
                            }
                        }

                        let delay = calculate_backoff(attempt, &reconnect);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    tracing::debug!("notification loop exiting");
}

/// One long-poll request: stream the body, emit complete batches.
///
/// Lines accumulate until a `@<pos>` marker line closes the batch; only
/// then are the batch's events broadcast and the cursor advanced, so a
/// half-received batch never leaks out of order.
async fn poll_once(
    http: &reqwest::Client,
    notify_url: &Url,
    cursor: &mut NotificationCursor,
    event_tx: &broadcast::Sender<Arc<HubEvent>>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut url = notify_url.clone();
    if let Some(pos) = cursor.position() {
        url.query_pairs_mut().append_pair("abs", &pos.to_string());
    }

    tracing::debug!(url = %url, "opening notification poll");
    let resp = http.get(url).send().await?.error_for_status()?;

    let mut body = resp.bytes_stream();
    let mut pending = String::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            chunk = body.next() => chunk,
        };

        let Some(chunk) = chunk else {
            // Stream ended; anything without a closing marker is dropped
            // as a transient decode failure.
            return Ok(());
        };
        pending.push_str(&String::from_utf8_lossy(&chunk?));

        // Emit every complete batch (terminated by a marker line).
        while let Some(batch_end) = find_marker_end(&pending) {
            let batch: String = pending.drain(..batch_end).collect();
            let Some(parsed) = parse_batch(batch.trim_end_matches('\n')) else {
                continue;
            };

            match cursor.observe(parsed.position) {
                CursorAction::Advanced => {
                    for event in parsed.events {
                        // Send errors just mean no active subscribers.
                        let _ = event_tx.send(Arc::new(event));
                    }
                }
                CursorAction::Reset => {
                    // Restart the poll from zero; buffered remainder is
                    // from before the restart and no longer meaningful.
                    return Ok(());
                }
            }
        }
    }
}

/// Byte offset just past the first complete `@<digits>\n` marker line,
/// if the buffer contains one.
fn find_marker_end(buffer: &str) -> Option<usize> {
    let mut search_from = 0;
    loop {
        let at = buffer[search_from..].find('@')? + search_from;
        let line_start = at == 0 || buffer.as_bytes()[at - 1] == b'\n';
        if line_start {
            if let Some(nl) = buffer[at..].find('\n') {
                return Some(at + nl + 1);
            }
            // Marker still incomplete; wait for more bytes.
            return None;
        }
        search_from = at + 1;
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64()
        * 2.0_f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
