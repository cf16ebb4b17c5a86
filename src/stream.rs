//! Streamed completion decoding
//!
//! Converts the raw body of a streaming completion into an ordered
//! sequence of text deltas. Framing is line-based: each line optionally
//! carries a `data:` marker, a payload of exactly `[DONE]` ends the stream,
//! and every other payload is one JSON chunk record.

mod decoder;
mod frame;

#[cfg(test)]
mod proptests;

pub use decoder::decode_stream;
