//! Property-based tests for stream decoding
//!
//! Chunk boundaries chosen by the network must never change the decoded
//! output.

use super::decoder::StreamDecoder;
use proptest::prelude::*;

// ============================================================================
// Generators
// ============================================================================

/// Delta text including multi-byte characters and JSON escapes
fn arb_delta() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 éü漢字🙂\"\\\\\n]{1,12}"
}

fn encode(deltas: &[String], done: bool) -> Vec<u8> {
    let mut body = String::new();
    for delta in deltas {
        body.push_str("data: ");
        body.push_str(&serde_json::json!({"choices": [{"delta": {"content": delta}}]}).to_string());
        body.push_str("\n\n");
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body.into_bytes()
}

/// Split `bytes` at the given cut points (taken modulo the length)
fn split_at_points(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    let mut points: Vec<usize> = cuts.iter().map(|c| c % bytes.len()).collect();
    points.sort_unstable();
    points.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points {
        chunks.push(bytes[start..point].to_vec());
        start = point;
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

fn decode_chunks(chunks: &[Vec<u8>]) -> (Vec<String>, usize) {
    let mut decoder = StreamDecoder::new();
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend(decoder.feed(chunk).unwrap());
    }
    out.extend(decoder.finish().unwrap());
    (out, decoder.malformed_frames())
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Any chunking yields the same deltas as a single read
    #[test]
    fn prop_chunking_is_invisible(
        deltas in proptest::collection::vec(arb_delta(), 0..8),
        cuts in proptest::collection::vec(any::<usize>(), 0..16),
        done in any::<bool>(),
    ) {
        let body = encode(&deltas, done);
        let (whole, _) = decode_chunks(&[body.clone()]);
        let (chunked, malformed) = decode_chunks(&split_at_points(&body, &cuts));

        prop_assert_eq!(&whole, &deltas);
        prop_assert_eq!(&chunked, &deltas);
        prop_assert_eq!(malformed, 0);
    }

    /// Byte-at-a-time delivery reassembles every delta
    #[test]
    fn prop_single_byte_reads(deltas in proptest::collection::vec(arb_delta(), 1..4)) {
        let body = encode(&deltas, true);
        let chunks: Vec<Vec<u8>> = body.iter().map(|b| vec![*b]).collect();
        let (decoded, _) = decode_chunks(&chunks);
        prop_assert_eq!(decoded.concat(), deltas.concat());
    }

    /// Nothing after the termination token is ever emitted
    #[test]
    fn prop_nothing_after_done(
        before in proptest::collection::vec(arb_delta(), 0..4),
        after in proptest::collection::vec(arb_delta(), 1..4),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut body = encode(&before, true);
        body.extend(encode(&after, false));
        let (decoded, _) = decode_chunks(&split_at_points(&body, &cuts));
        prop_assert_eq!(decoded, before);
    }

    /// Garbage lines are skipped and never abort the stream
    #[test]
    fn prop_malformed_lines_are_skipped(
        deltas in proptest::collection::vec(arb_delta(), 1..4),
        garbage in "[a-z]{1,10}",
    ) {
        let mut body = Vec::new();
        for delta in &deltas {
            body.extend(encode(std::slice::from_ref(delta), false));
            body.extend(format!("data: {{{garbage}\n").into_bytes());
        }
        let (decoded, malformed) = decode_chunks(&[body]);
        prop_assert_eq!(decoded, deltas.clone());
        prop_assert_eq!(malformed, deltas.len());
    }
}
