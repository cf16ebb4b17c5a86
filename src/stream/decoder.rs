//! Incremental line decoder for streamed completion bodies

use super::frame::{parse_line, Frame};
use crate::error::{ExchangeError, ExchangeErrorKind};
use futures::{Stream, StreamExt};
use std::fmt::Display;

/// Longest line kept in memory; anything longer is skipped as malformed
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Per-request decoding state; never reused across requests
#[derive(Debug, Default)]
struct StreamState {
    /// Bytes of the trailing line not yet terminated by `\n`
    raw_buffer: Vec<u8>,
    /// Prefix of `raw_buffer` already known to hold no newline
    scanned: usize,
    /// Inside an overlong line; drop bytes up to its newline
    discarding: bool,
    terminated: bool,
    error: Option<ExchangeError>,
    malformed_frames: usize,
}

impl StreamState {
    fn clear_buffer(&mut self) {
        self.raw_buffer.clear();
        self.scanned = 0;
    }
}

/// Turns network reads into text deltas.
///
/// Lines are split on raw bytes before decoding, so a multi-byte UTF-8
/// sequence split across two reads is reassembled intact.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    state: StreamState,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the termination token, source exhaustion or an error was seen
    pub fn is_terminated(&self) -> bool {
        self.state.terminated
    }

    /// Frames skipped because they could not be parsed
    pub fn malformed_frames(&self) -> usize {
        self.state.malformed_frames
    }

    /// Feed one read. Returns the deltas completed by it, in line order.
    ///
    /// After a normal end further input is ignored; after a failure the
    /// same error is returned again.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, ExchangeError> {
        let mut deltas = Vec::new();
        if self.state.terminated {
            return self.after_termination(deltas);
        }

        self.state.raw_buffer.extend_from_slice(chunk);

        let mut line_start = 0;
        let mut scan_from = self.state.scanned;
        while let Some(offset) = self.state.raw_buffer[scan_from..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let line_end = scan_from + offset;
            if self.state.discarding {
                // Tail of an overlong line, already counted
                self.state.discarding = false;
            } else {
                let frame = parse_line(&self.state.raw_buffer[line_start..line_end]);
                self.apply(frame, &mut deltas)?;
                if self.state.terminated {
                    self.state.clear_buffer();
                    return Ok(deltas);
                }
            }
            line_start = line_end + 1;
            scan_from = line_start;
        }

        self.state.raw_buffer.drain(..line_start);
        if self.state.raw_buffer.len() > MAX_LINE_BYTES {
            self.skip_overlong_line();
        }
        self.state.scanned = self.state.raw_buffer.len();
        Ok(deltas)
    }

    /// Source exhausted without a termination token: normal end.
    ///
    /// A trailing line the server never newline-terminated is incomplete
    /// and is dropped.
    pub fn finish(&mut self) -> Result<Vec<String>, ExchangeError> {
        let deltas = Vec::new();
        if self.state.terminated {
            return self.after_termination(deltas);
        }

        if !self.state.raw_buffer.is_empty() {
            tracing::debug!(
                bytes = self.state.raw_buffer.len(),
                "Dropping unterminated line at end of stream"
            );
        }
        self.state.clear_buffer();
        self.state.discarding = false;
        self.state.terminated = true;
        Ok(deltas)
    }

    /// Read failure from the source. The partial line is dropped.
    pub fn fail(&mut self, message: impl Into<String>) -> ExchangeError {
        let error = ExchangeError::decode(message);
        self.state.clear_buffer();
        self.state.terminated = true;
        self.state.error = Some(error.clone());
        error
    }

    fn skip_overlong_line(&mut self) {
        if !self.state.discarding {
            self.state.malformed_frames += 1;
            tracing::warn!(
                kind = ?ExchangeErrorKind::MalformedFrame,
                max_bytes = MAX_LINE_BYTES,
                malformed_frames = self.state.malformed_frames,
                "Skipping overlong stream line"
            );
            self.state.discarding = true;
        }
        self.state.clear_buffer();
    }

    fn after_termination(&self, deltas: Vec<String>) -> Result<Vec<String>, ExchangeError> {
        match &self.state.error {
            Some(error) => Err(error.clone()),
            None => Ok(deltas),
        }
    }

    fn apply(&mut self, frame: Frame, deltas: &mut Vec<String>) -> Result<(), ExchangeError> {
        match frame {
            Frame::Blank | Frame::Comment | Frame::Delta(None) => {}
            Frame::Delta(Some(text)) => deltas.push(text),
            Frame::Done => {
                tracing::debug!(deltas = deltas.len(), "Stream termination token received");
                self.state.terminated = true;
            }
            Frame::Malformed { reason, payload } => {
                self.state.malformed_frames += 1;
                tracing::warn!(
                    kind = ?ExchangeErrorKind::MalformedFrame,
                    error = %reason,
                    payload = %payload,
                    malformed_frames = self.state.malformed_frames,
                    "Skipping malformed stream frame"
                );
            }
            Frame::ProviderError(message) => {
                return Err(self.fail(format!("provider error: {message}")));
            }
        }
        Ok(())
    }
}

/// Decode a response body into a lazy stream of deltas.
///
/// The stream ends after the termination token or when the body is
/// exhausted. A read failure or a provider error frame yields one `Err`
/// and then ends. Dropping the returned stream drops the body.
pub fn decode_stream<S, B, E>(body: S) -> impl Stream<Item = Result<String, ExchangeError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(decoder.fail(format!("stream read error: {e}")));
                    return;
                }
            };

            match decoder.feed(chunk.as_ref()) {
                Ok(deltas) => {
                    for delta in deltas {
                        yield Ok(delta);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }

            if decoder.is_terminated() {
                break;
            }
        }

        match decoder.finish() {
            Ok(deltas) => {
                for delta in deltas {
                    yield Ok(delta);
                }
            }
            Err(e) => {
                yield Err(e);
                return;
            }
        }

        if decoder.malformed_frames() > 0 {
            tracing::info!(malformed_frames = decoder.malformed_frames(), "Stream ended with skipped frames");
        }
    }
}
