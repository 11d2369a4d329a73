//! Turns a generation response body into text increments.
//!
//! Bytes are decoded incrementally as UTF-8, so a multi-byte character split
//! across two network chunks is emitted once both halves have arrived.
//! A chunk that decodes to exactly `"\n"` is dropped when the text emitted so
//! far already ends in a newline; the upstream protocol produces these blank
//! line artifacts between events.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TurnError;

const REPLACEMENT: char = '\u{FFFD}';

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
///
/// Invalid sequences decode to U+FFFD, matching `String::from_utf8_lossy` on
/// the concatenated input regardless of where the chunk boundaries fall.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, holding back a trailing partial sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.extend_from_slice(chunk);

        let mut out = String::with_capacity(buffer.len());
        let mut input = buffer.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(REPLACEMENT);
                            input = &rest[invalid..];
                        }
                        None => {
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush at end of stream. A dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            REPLACEMENT.to_string()
        }
    }

    /// Whether bytes of an incomplete character are being held back.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Pulls chunks from a byte stream and yields de-duplicated text increments.
///
/// Stops without error once `cancel` fires; the caller keeps whatever it has
/// already received.
pub struct StreamConsumer<S> {
    body: S,
    decoder: Utf8Decoder,
    cancel: CancellationToken,
    ends_with_newline: bool,
    emitted_chars: usize,
    finished: bool,
    cancelled: bool,
}

impl<S> StreamConsumer<S>
where
    S: Stream<Item = Result<Bytes, TurnError>> + Unpin,
{
    pub fn new(body: S, cancel: CancellationToken) -> Self {
        Self {
            body,
            decoder: Utf8Decoder::new(),
            cancel,
            ends_with_newline: false,
            emitted_chars: 0,
            finished: false,
            cancelled: false,
        }
    }

    /// Wait for the next text increment.
    ///
    /// Returns `Ok(None)` when the body is exhausted or the consumer was
    /// cancelled; check [`was_cancelled`](Self::was_cancelled) to tell them
    /// apart. A read failure is returned once and ends the stream.
    pub async fn next_increment(&mut self) -> Result<Option<String>, TurnError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.finished = true;
                    self.cancelled = true;
                    debug!(chars = self.emitted_chars, "Stream consumer cancelled");
                    return Ok(None);
                }
                next = self.body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let text = self.decoder.decode(&chunk);
                    if let Some(increment) = self.accept(text) {
                        return Ok(Some(increment));
                    }
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Err(err);
                }
                None => {
                    self.finished = true;
                    let tail = self.decoder.finish();
                    return Ok(self.accept(tail));
                }
            }
        }
    }

    /// Drain the remaining increments into one string.
    pub async fn collect_text(mut self) -> Result<String, TurnError> {
        let mut text = String::new();
        while let Some(increment) = self.next_increment().await? {
            text.push_str(&increment);
        }
        Ok(text)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn accept(&mut self, text: String) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        if text == "\n" && self.ends_with_newline {
            return None;
        }
        self.ends_with_newline = text.ends_with('\n');
        self.emitted_chars += text.chars().count();
        Some(text)
    }
}
