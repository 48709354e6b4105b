//! Splitting large messages into bounded envelopes and putting them back
//! together.
//!
//! The relay caps the size of a single frame, but application messages
//! (a long chat transcript, a base64 screenshot) can be much larger. The
//! sender runs every outbound message through [`MessageChunker::split`];
//! the receiver feeds every inbound payload to [`MessageChunker::receive`].
//!
//! A message at or below the chunk size goes out unchanged. Anything
//! larger becomes a group of envelopes sharing one random id:
//!
//! ```text
//! {"_chunk":{"id":"9f2c…","seq":0,"total":4},"_data":"…first 64 KiB…"}
//! {"_chunk":{"id":"9f2c…","seq":1,"total":4},"_data":"…"}
//! ```
//!
//! Slices are budgeted by their escaped size, not their raw size: each
//! envelope is JSON text that is itself carried as a JSON string inside a
//! relay frame, so quotes, backslashes and control characters cost more
//! than one byte on the wire.
//!
//! Reassembly does not care about arrival order. A repeated `seq`
//! overwrites the earlier slice. Payloads that do not look like a valid
//! envelope are delivered as-is, so unchunked peers interoperate.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{JsonCodec, ProtocolError, random_hex};

/// Default upper bound on the encoded bytes of message text per envelope.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Default cap on `total` in an incoming envelope.
///
/// Anything claiming more chunks than this is treated as an ordinary
/// message instead of allocating a huge slot table.
pub const MAX_CHUNKS_PER_MESSAGE: u32 = 4096;

/// Default cap on groups reassembled at once. The oldest is dropped to
/// make room for a new one.
pub const MAX_PENDING_GROUPS: usize = 64;

/// How many flushed group ids are remembered to drop late duplicates.
const COMPLETED_MEMORY: usize = 1024;

/// Bytes `c` occupies once escaped into a JSON string and escaped again
/// when that JSON is carried as a string in a relay frame.
fn relay_cost(c: char) -> usize {
    match c {
        '"' | '\\' => 4,
        '\n' | '\r' | '\t' | '\u{8}' | '\u{c}' => 3,
        c if (c as u32) < 0x20 => 7,
        c => c.len_utf8(),
    }
}

/// Encoded size of `text` under [`relay_cost`].
fn relay_len(text: &str) -> usize {
    text.chars().map(relay_cost).sum()
}

/// Position of one envelope within its group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Random group id shared by all envelopes of one message.
    pub id: String,
    /// Zero-based position in the group.
    pub seq: u32,
    /// Number of envelopes in the group.
    pub total: u32,
}

/// One slice of a chunked message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Group and position.
    #[serde(rename = "_chunk")]
    pub chunk: ChunkHeader,
    /// The slice of message text.
    #[serde(rename = "_data")]
    pub data: String,
}

struct PendingGroup {
    total: u32,
    slots: Vec<Option<String>>,
    filled: u32,
}

impl PendingGroup {
    fn new(total: u32) -> Self {
        Self {
            total,
            slots: vec![None; total as usize],
            filled: 0,
        }
    }

    fn insert(&mut self, seq: u32, data: String) {
        let slot = &mut self.slots[seq as usize];
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(data);
    }

    fn is_complete(&self) -> bool {
        self.filled == self.total
    }

    fn concat(self) -> String {
        let len = self.slots.iter().flatten().map(String::len).sum();
        let mut out = String::with_capacity(len);
        for slice in self.slots.into_iter().flatten() {
            out.push_str(&slice);
        }
        out
    }
}

/// Splits outbound messages and reassembles inbound ones.
///
/// One chunker belongs to one connection. It is not shared across
/// connections and should be [`clear`](Self::clear)ed whenever its
/// transport goes away.
pub struct MessageChunker {
    max_chunk_size: usize,
    max_chunks: u32,
    codec: JsonCodec,
    pending: HashMap<String, PendingGroup>,
    pending_order: VecDeque<String>,
    max_pending: usize,
    completed: VecDeque<String>,
    completed_ids: HashSet<String>,
}

impl Default for MessageChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageChunker {
    /// Creates a chunker with the default 64 KiB chunk size.
    pub fn new() -> Self {
        Self::with_max_chunk_size(MAX_CHUNK_SIZE)
    }

    /// Creates a chunker with a custom chunk size (at least 1 byte).
    pub fn with_max_chunk_size(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size: max_chunk_size.max(1),
            max_chunks: MAX_CHUNKS_PER_MESSAGE,
            codec: JsonCodec,
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            max_pending: MAX_PENDING_GROUPS,
            completed: VecDeque::new(),
            completed_ids: HashSet::new(),
        }
    }

    /// Overrides the cap on `total` accepted from the wire.
    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    /// Overrides how many groups may be in flight at once.
    pub fn with_max_pending_groups(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// The configured chunk size in bytes.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Splits `message` into the frames to send, in order.
    ///
    /// Returns the message unchanged as a single frame when its encoded
    /// size fits. For text without characters JSON escapes, that is its
    /// length in bytes. Slices never cut a UTF-8 code point in half.
    pub fn split(&self, message: &str) -> Result<Vec<String>, ProtocolError> {
        if relay_len(message) <= self.max_chunk_size {
            return Ok(vec![message.to_string()]);
        }

        let slices = self.slices(message);
        let total = u32::try_from(slices.len()).map_err(|_| {
            ProtocolError::InvalidMessage(format!(
                "message of {} bytes needs too many chunks",
                message.len()
            ))
        })?;
        let id = random_hex(8);

        slices
            .into_iter()
            .enumerate()
            .map(|(seq, data)| {
                let envelope = ChunkEnvelope {
                    chunk: ChunkHeader {
                        id: id.clone(),
                        seq: seq as u32,
                        total,
                    },
                    data: data.to_string(),
                };
                self.codec.encode_str(&envelope)
            })
            .collect()
    }

    fn slices<'a>(&self, message: &'a str) -> Vec<&'a str> {
        let mut slices = Vec::new();
        let mut start = 0;
        let mut used = 0;
        for (at, c) in message.char_indices() {
            let cost = relay_cost(c);
            // A slice always takes at least one code point.
            if used + cost > self.max_chunk_size && at > start {
                slices.push(&message[start..at]);
                start = at;
                used = 0;
            }
            used += cost;
        }
        if start < message.len() {
            slices.push(&message[start..]);
        }
        slices
    }

    /// Feeds one inbound payload.
    ///
    /// Returns `Some(message)` when `raw` is a whole message on its own or
    /// completes a group, `None` while a group is still missing pieces.
    pub fn receive(&mut self, raw: &str) -> Option<String> {
        let envelope: ChunkEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(_) => return Some(raw.to_string()),
        };
        let ChunkEnvelope { chunk, data } = envelope;

        if chunk.total == 0 || chunk.seq >= chunk.total || chunk.total > self.max_chunks {
            tracing::debug!(
                id = %chunk.id,
                seq = chunk.seq,
                total = chunk.total,
                "malformed chunk header, delivering payload as-is"
            );
            return Some(raw.to_string());
        }

        if self.completed_ids.contains(&chunk.id) {
            tracing::trace!(id = %chunk.id, seq = chunk.seq, "late chunk for completed group dropped");
            return None;
        }

        if !self.pending.contains_key(&chunk.id) {
            self.make_room();
            self.pending_order.push_back(chunk.id.clone());
        }
        let group = self
            .pending
            .entry(chunk.id.clone())
            .or_insert_with(|| PendingGroup::new(chunk.total));
        if group.total != chunk.total {
            tracing::warn!(
                id = %chunk.id,
                expected = group.total,
                got = chunk.total,
                "chunk total disagrees with its group, dropped"
            );
            return None;
        }

        group.insert(chunk.seq, data);
        if !group.is_complete() {
            return None;
        }

        let group = self.pending.remove(&chunk.id)?;
        self.pending_order.retain(|id| *id != chunk.id);
        self.remember_completed(chunk.id);
        Some(group.concat())
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.max_pending {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            if self.pending.remove(&oldest).is_some() {
                tracing::warn!(id = %oldest, "too many partial chunk groups, dropped the oldest");
            }
        }
    }

    fn remember_completed(&mut self, id: String) {
        if self.completed.len() >= COMPLETED_MEMORY {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_ids.remove(&oldest);
            }
        }
        self.completed_ids.insert(id.clone());
        self.completed.push_back(id);
    }

    /// Discards every partially received group.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(groups = self.pending.len(), "discarding partial chunk groups");
        }
        self.pending.clear();
        self.pending_order.clear();
    }

    /// Number of groups still waiting for chunks.
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str, seq: u32, total: u32, data: &str) -> String {
        serde_json::to_string(&ChunkEnvelope {
            chunk: ChunkHeader {
                id: id.into(),
                seq,
                total,
            },
            data: data.into(),
        })
        .expect("serialize envelope")
    }

    // ---------------------------------------------------------------------
    // split()
    // ---------------------------------------------------------------------

    #[test]
    fn test_split_small_message_is_unchanged() {
        let chunker = MessageChunker::new();
        let frames = chunker.split("hello").expect("split");
        assert_eq!(frames, vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_exactly_max_size_is_single_frame() {
        let chunker = MessageChunker::with_max_chunk_size(8);
        let frames = chunker.split("12345678").expect("split");
        assert_eq!(frames, vec!["12345678".to_string()]);
    }

    #[test]
    fn test_split_one_byte_over_gives_two_chunks() {
        let chunker = MessageChunker::with_max_chunk_size(8);
        let frames = chunker.split("123456789").expect("split");
        assert_eq!(frames.len(), 2);

        let first: ChunkEnvelope = serde_json::from_str(&frames[0]).expect("parse");
        let second: ChunkEnvelope = serde_json::from_str(&frames[1]).expect("parse");
        assert_eq!(first.chunk.id, second.chunk.id);
        assert_eq!((first.chunk.seq, first.chunk.total), (0, 2));
        assert_eq!((second.chunk.seq, second.chunk.total), (1, 2));
        assert_eq!(first.data, "12345678");
        assert_eq!(second.data, "9");
    }

    #[test]
    fn test_split_never_cuts_a_code_point() {
        // "é" is two bytes; a 3-byte chunk can hold only one of them.
        let chunker = MessageChunker::with_max_chunk_size(3);
        let message = "éééé";
        let frames = chunker.split(message).expect("split");
        assert_eq!(frames.len(), 4);
        for frame in &frames {
            let env: ChunkEnvelope = serde_json::from_str(frame).expect("parse");
            assert_eq!(env.data, "é");
        }
    }

    #[test]
    fn test_split_chunk_smaller_than_code_point_still_progresses() {
        let chunker = MessageChunker::with_max_chunk_size(1);
        let frames = chunker.split("😀a").expect("split");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_split_uses_fresh_id_per_message() {
        let chunker = MessageChunker::with_max_chunk_size(2);
        let a: ChunkEnvelope =
            serde_json::from_str(&chunker.split("abcd").expect("split")[0]).expect("parse");
        let b: ChunkEnvelope =
            serde_json::from_str(&chunker.split("abcd").expect("split")[0]).expect("parse");
        assert_ne!(a.chunk.id, b.chunk.id);
    }

    #[test]
    fn test_split_budgets_escaped_characters() {
        // Quotes and backslashes cost 4 bytes, newlines 3, other controls 7.
        let chunker = MessageChunker::with_max_chunk_size(8);
        let frames = chunker.split("\"\"\"\\\\\n\u{1}").expect("split");
        let data: Vec<String> = frames
            .iter()
            .map(|f| serde_json::from_str::<ChunkEnvelope>(f).expect("parse").data)
            .collect();
        assert_eq!(data, vec!["\"\"", "\"\\", "\\\n", "\u{1}"]);
    }

    #[test]
    fn test_split_plain_text_cost_is_byte_length() {
        assert_eq!(relay_len("plain text é"), "plain text é".len());
        assert_eq!(relay_len("a\"b"), 6);
    }

    #[test]
    fn test_split_escape_heavy_message_is_chunked() {
        let chunker = MessageChunker::with_max_chunk_size(10);
        // Ten raw bytes, forty once double-escaped: two quotes per slice.
        let frames = chunker.split(&"\"".repeat(10)).expect("split");
        assert_eq!(frames.len(), 5);
    }

    // ---------------------------------------------------------------------
    // receive()
    // ---------------------------------------------------------------------

    #[test]
    fn test_receive_plain_text_passes_through() {
        let mut chunker = MessageChunker::new();
        assert_eq!(chunker.receive("not json at all"), Some("not json at all".into()));
    }

    #[test]
    fn test_receive_json_without_chunk_passes_through() {
        let mut chunker = MessageChunker::new();
        let raw = r#"{"type":"req","id":"1","method":"sessions.list"}"#;
        assert_eq!(chunker.receive(raw), Some(raw.to_string()));
    }

    #[test]
    fn test_receive_out_of_order_reassembles() {
        let mut chunker = MessageChunker::new();
        assert_eq!(chunker.receive(&envelope("g", 2, 3, "c")), None);
        assert_eq!(chunker.receive(&envelope("g", 0, 3, "a")), None);
        assert_eq!(chunker.pending_groups(), 1);
        assert_eq!(chunker.receive(&envelope("g", 1, 3, "b")), Some("abc".into()));
        assert_eq!(chunker.pending_groups(), 0);
    }

    #[test]
    fn test_receive_duplicate_seq_last_write_wins() {
        let mut chunker = MessageChunker::new();
        assert_eq!(chunker.receive(&envelope("g", 0, 2, "old")), None);
        assert_eq!(chunker.receive(&envelope("g", 0, 2, "new")), None);
        assert_eq!(chunker.receive(&envelope("g", 1, 2, "!")), Some("new!".into()));
    }

    #[test]
    fn test_receive_late_chunk_after_flush_is_dropped() {
        let mut chunker = MessageChunker::new();
        chunker.receive(&envelope("g", 0, 2, "a"));
        assert_eq!(chunker.receive(&envelope("g", 1, 2, "b")), Some("ab".into()));
        assert_eq!(chunker.receive(&envelope("g", 1, 2, "b")), None);
        assert_eq!(chunker.pending_groups(), 0);
    }

    #[test]
    fn test_receive_malformed_headers_pass_through() {
        let mut chunker = MessageChunker::new().with_max_chunks(10);
        for raw in [
            envelope("g", 0, 0, "x"),
            envelope("g", 3, 3, "x"),
            envelope("g", 0, 11, "x"),
        ] {
            assert_eq!(chunker.receive(&raw), Some(raw.clone()));
        }
        assert_eq!(chunker.pending_groups(), 0);
    }

    #[test]
    fn test_receive_mismatched_total_is_dropped() {
        let mut chunker = MessageChunker::new();
        assert_eq!(chunker.receive(&envelope("g", 0, 2, "a")), None);
        assert_eq!(chunker.receive(&envelope("g", 1, 3, "b")), None);
        assert_eq!(chunker.receive(&envelope("g", 1, 2, "b")), Some("ab".into()));
    }

    #[test]
    fn test_clear_discards_partial_groups() {
        let mut chunker = MessageChunker::new();
        chunker.receive(&envelope("g", 0, 2, "a"));
        chunker.clear();
        assert_eq!(chunker.pending_groups(), 0);
        // The group starts over; the earlier slice is gone.
        assert_eq!(chunker.receive(&envelope("g", 1, 2, "b")), None);
    }

    #[test]
    fn test_pending_groups_are_capped_oldest_first() {
        let mut chunker = MessageChunker::new().with_max_pending_groups(2);
        assert_eq!(chunker.receive(&envelope("a", 0, 2, "a0")), None);
        assert_eq!(chunker.receive(&envelope("b", 0, 2, "b0")), None);
        assert_eq!(chunker.receive(&envelope("c", 0, 2, "c0")), None);
        assert_eq!(chunker.pending_groups(), 2);

        // "a" was evicted; its second half starts a fresh group.
        assert_eq!(chunker.receive(&envelope("a", 1, 2, "a1")), None);
        assert_eq!(chunker.receive(&envelope("c", 1, 2, "c1")), Some("c0c1".into()));
        assert_eq!(chunker.pending_order.len(), chunker.pending_groups());
    }

    #[test]
    fn test_completed_memory_is_bounded() {
        let mut chunker = MessageChunker::new();
        for i in 0..(COMPLETED_MEMORY + 10) {
            let id = format!("g{i}");
            assert!(chunker.receive(&envelope(&id, 0, 1, "x")).is_some());
        }
        assert_eq!(chunker.completed.len(), COMPLETED_MEMORY);
        assert_eq!(chunker.completed_ids.len(), COMPLETED_MEMORY);
        // The oldest id has been forgotten and can complete again.
        assert_eq!(chunker.receive(&envelope("g0", 0, 1, "x")), Some("x".into()));
    }
}
