//! End-to-end checks of the chunk codec: whatever one chunker splits,
//! another reassembles, regardless of arrival order.

use pairlink_protocol::{
    ChunkEnvelope, Codec, JsonCodec, MAX_CHUNK_SIZE, MessageChunker, RelayFrame,
};
use rand::seq::SliceRandom;

fn big_message(len: usize) -> String {
    (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect()
}

#[test]
fn test_200_kib_message_splits_into_four_chunks() {
    let message = big_message(200 * 1024);
    let frames = MessageChunker::new().split(&message).expect("split");

    // ceil(204800 / 65536) = 4
    assert_eq!(frames.len(), 4);
    let seqs: Vec<u32> = frames
        .iter()
        .map(|f| {
            serde_json::from_str::<ChunkEnvelope>(f)
                .expect("envelope")
                .chunk
                .seq
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[test]
fn test_shuffled_chunks_reassemble_to_original() {
    let message = big_message(5 * MAX_CHUNK_SIZE + 123);
    let sender = MessageChunker::new();
    let mut receiver = MessageChunker::new();

    let mut frames = sender.split(&message).expect("split");
    assert_eq!(frames.len(), 6);
    frames.shuffle(&mut rand::rng());

    let mut delivered = Vec::new();
    for frame in &frames {
        if let Some(msg) = receiver.receive(frame) {
            delivered.push(msg);
        }
    }
    assert_eq!(delivered.len(), 1, "exactly one flush per group");
    assert_eq!(delivered[0], message);
    assert_eq!(receiver.pending_groups(), 0);
}

#[test]
fn test_interleaved_groups_reassemble_independently() {
    let sender = MessageChunker::with_max_chunk_size(16);
    let mut receiver = MessageChunker::with_max_chunk_size(16);

    let a = big_message(40);
    let b: String = "zyxwvutsrqponmlkjihgfedcba0123456789".into();
    let frames_a = sender.split(&a).expect("split a");
    let frames_b = sender.split(&b).expect("split b");

    let mut out = Vec::new();
    for (fa, fb) in frames_a.iter().zip(frames_b.iter()) {
        out.extend(receiver.receive(fb));
        out.extend(receiver.receive(fa));
    }
    for rest in frames_a.iter().skip(frames_b.len()) {
        out.extend(receiver.receive(rest));
    }
    for rest in frames_b.iter().skip(frames_a.len()) {
        out.extend(receiver.receive(rest));
    }

    out.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(out, expected);
}

#[test]
fn test_multibyte_text_round_trips() {
    let message = "héllo wörld 😀 ".repeat(10_000);
    let sender = MessageChunker::with_max_chunk_size(1000);
    let mut receiver = MessageChunker::new();

    let frames = sender.split(&message).expect("split");
    assert!(frames.len() >= message.len() / 1000);

    let result = frames.iter().filter_map(|f| receiver.receive(f)).last();
    assert_eq!(result.as_deref(), Some(message.as_str()));
}

#[test]
fn test_escape_heavy_message_fits_relay_frames() {
    // Quotes, backslashes and control bytes grow when escaped twice.
    let unit = "\"\\\u{1}\n{\"k\":\"v\\\\\"}\t";
    let message = unit.repeat(40_000);
    let sender = MessageChunker::new();
    let mut receiver = MessageChunker::new();

    let frames = sender.split(&message).expect("split");
    for frame in &frames {
        let wire = JsonCodec
            .encode(&RelayFrame::Relay { data: frame.clone() })
            .expect("encode");
        assert!(wire.len() <= 256 * 1024, "relay frame of {} bytes", wire.len());
    }

    let result = frames.iter().filter_map(|f| receiver.receive(f)).last();
    assert_eq!(result.as_deref(), Some(message.as_str()));
}
