// Wire frame decoding
//
// Frames arrive over per-connection byte streams as either JSON arrays
// or packed MessagePack, in two shapes:
//
//   [tag, [[time, record], ...], options?]   multi-record
//   [tag, time, record, options?]            single record
//
// A binary frame is complete when the read ends with the 3-byte
// terminator; JSON clients may omit it, so buffered data starting with
// `[` is re-tried as JSON on every append. Decoding dispatches on the
// leading byte into two pure decode functions that share one
// post-decode normalization step.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::record::{as_num, Record};

pub mod split;

/// Terminator marking the end of a binary frame.
pub const FRAME_TERMINATOR: &[u8] = b"==\n";

/// A connection buffering more than this without completing a frame is
/// closed (resource-exhaustion guard).
pub const MAX_BUFFER_BYTES: usize = 10_000_000;

/// Which encoding a frame arrived in; acknowledgments are sent back in
/// the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    MsgPack,
}

/// One record with its effective timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedRecord {
    pub time: f64,
    pub record: Record,
}

/// One decoded logical frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: String,
    pub records: Vec<TimedRecord>,
    pub options: Record,
    pub format: WireFormat,
}

impl Frame {
    /// The chunk id to acknowledge, when the sender requested one.
    pub fn chunk(&self) -> Option<&Value> {
        self.options.get("chunk").filter(|v| !v.is_null())
    }

    /// Encode the `{ack: chunk}` reply in this frame's wire format.
    pub fn encode_ack(&self) -> Option<Vec<u8>> {
        let chunk = self.chunk()?;
        let ack = serde_json::json!({ "ack": chunk });
        match self.format {
            WireFormat::Json => serde_json::to_vec(&ack).ok(),
            WireFormat::MsgPack => rmp_serde::to_vec(&ack).ok(),
        }
    }
}

/// Why a connection must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("unterminated buffer exceeded size limit")]
    Oversized,
    #[error("undecodable frame")]
    Malformed,
    #[error("frame carries no tag")]
    EmptyTag,
}

/// Outcome of feeding one read's worth of bytes into the decoder.
#[derive(Debug)]
pub enum Decoded {
    /// Incomplete; more data needed.
    Pending,
    /// A complete frame.
    Frame(Box<Frame>),
    /// Protocol violation; the caller must close the connection.
    Close(CloseReason),
}

#[derive(Debug, Default)]
struct ConnBuffer {
    data: Vec<u8>,
    updated: i64,
}

/// Reassembles logical frames from per-connection byte streams.
///
/// Buffers are keyed by connection id and live until a frame completes,
/// the connection closes, or the idle sweep evicts them.
#[derive(Debug)]
pub struct FrameDecoder {
    buffers: HashMap<u64, ConnBuffer>,
    max_buffer_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_buffer_limit(MAX_BUFFER_BYTES)
    }

    pub fn with_buffer_limit(max_buffer_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_buffer_bytes,
        }
    }

    /// Feed one read's bytes for a connection. `now` is the wall clock
    /// in Unix seconds, used for idle tracking.
    pub fn push(&mut self, conn: u64, chunk: &[u8], now: i64) -> Decoded {
        if !chunk.ends_with(FRAME_TERMINATOR) {
            let buffer = self.buffers.entry(conn).or_default();
            buffer.data.extend_from_slice(chunk);
            buffer.updated = now;

            // JSON clients may never send the terminator; re-try a full
            // parse on every append.
            if buffer.data.first() == Some(&b'[') {
                if let Ok(frame) = decode_json(&buffer.data) {
                    self.buffers.remove(&conn);
                    return finish(frame);
                }
            }

            if self.buffers[&conn].data.len() > self.max_buffer_bytes {
                self.buffers.remove(&conn);
                return Decoded::Close(CloseReason::Oversized);
            }

            return Decoded::Pending;
        }

        // Terminator seen: any buffered prefix plus this chunk is the
        // complete frame body.
        let body = match self.buffers.remove(&conn) {
            Some(mut buffer) if !buffer.data.is_empty() => {
                buffer.data.extend_from_slice(chunk);
                buffer.data
            }
            _ => chunk.to_vec(),
        };

        let result = if body.first() == Some(&b'[') {
            decode_json(&body)
        } else {
            decode_binary(&body)
        };

        match result {
            Ok(frame) => finish(frame),
            Err(reason) => Decoded::Close(reason),
        }
    }

    /// Drop any buffered state for a closed connection.
    pub fn forget(&mut self, conn: u64) {
        self.buffers.remove(&conn);
    }

    /// Evict buffers idle for longer than `max_idle_secs`; returns how
    /// many were dropped.
    pub fn evict_idle(&mut self, now: i64, max_idle_secs: i64) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now - buffer.updated <= max_idle_secs);
        before - self.buffers.len()
    }

    pub fn buffered_connections(&self) -> usize {
        self.buffers.len()
    }
}

fn finish(frame: Frame) -> Decoded {
    if frame.tag.is_empty() {
        return Decoded::Close(CloseReason::EmptyTag);
    }
    Decoded::Frame(Box::new(frame))
}

/// Decode a JSON frame body (trailing terminator junk trimmed off).
fn decode_json(body: &[u8]) -> Result<Frame, CloseReason> {
    let text = std::str::from_utf8(body).map_err(|_| CloseReason::Malformed)?;
    let trimmed = text.trim_end_matches(['/', '=', '\n', '\r', ' ']);
    let value: Value = serde_json::from_str(trimmed).map_err(|_| CloseReason::Malformed)?;
    let Value::Array(items) = value else {
        return Err(CloseReason::Malformed);
    };
    normalize(items, None, WireFormat::Json)
}

/// Decode a packed binary frame body.
fn decode_binary(body: &[u8]) -> Result<Frame, CloseReason> {
    let mut cursor = body;
    let value = rmpv::decode::read_value(&mut cursor).map_err(|_| CloseReason::Malformed)?;
    let rmpv::Value::Array(items) = value else {
        return Err(CloseReason::Malformed);
    };

    // A second element that is not itself a sequence carries the
    // concatenated packed records of a delayed-parse frame.
    let delayed = match items.get(1) {
        Some(rmpv::Value::Binary(blob)) => Some(split::split_packed(blob)),
        Some(rmpv::Value::String(s)) => Some(split::split_packed(s.as_bytes())),
        _ => None,
    };

    let mut json_items = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        if index == 1 && delayed.is_some() {
            // Placeholder; the delayed records replace it.
            json_items.push(Value::Null);
            continue;
        }
        json_items.push(mp_to_json(item).ok_or(CloseReason::Malformed)?);
    }

    normalize(json_items, delayed, WireFormat::MsgPack)
}

/// Shared post-decode step: classify the frame shape, apply the
/// record-level time override and produce the canonical record list.
fn normalize(
    items: Vec<Value>,
    delayed: Option<Vec<Value>>,
    format: WireFormat,
) -> Result<Frame, CloseReason> {
    let multi = delayed.is_some() || matches!(items.get(1), Some(Value::Array(_)));
    let mut items = items.into_iter();

    let tag = match items.next() {
        Some(Value::String(tag)) => tag,
        _ => return Err(CloseReason::EmptyTag),
    };

    let raw_records = if let Some(records) = delayed {
        items.next();
        records
    } else if multi {
        match items.next() {
            Some(Value::Array(records)) => records,
            _ => return Err(CloseReason::Malformed),
        }
    } else {
        // Single-record form [tag, time, record, options?].
        let time = items.next().ok_or(CloseReason::Malformed)?;
        let record = items.next().ok_or(CloseReason::Malformed)?;
        vec![Value::Array(vec![time, record])]
    };

    // Delayed-parse payloads are best-effort; a bad entry elsewhere is
    // a protocol error.
    let lenient = format == WireFormat::MsgPack && multi;
    let mut records = Vec::with_capacity(raw_records.len());
    for raw in raw_records {
        match shape_record(raw) {
            Some(record) => records.push(record),
            None if lenient => continue,
            None => return Err(CloseReason::Malformed),
        }
    }

    let options = match items.next() {
        Some(Value::Object(map)) => map,
        _ => Record::new(),
    };

    Ok(Frame {
        tag,
        records,
        options,
        format,
    })
}

fn shape_record(raw: Value) -> Option<TimedRecord> {
    let Value::Array(mut pair) = raw else {
        return None;
    };
    if pair.len() != 2 {
        return None;
    }
    let record = match pair.pop() {
        Some(Value::Object(map)) => map,
        _ => return None,
    };
    let frame_time = pair.pop().and_then(|t| as_num(&t))?;

    // A record carrying its own positive `time` field overrides the
    // frame timestamp.
    let time = match record.get("time").and_then(as_num) {
        Some(t) if t > 0.0 => t,
        _ => frame_time,
    };

    Some(TimedRecord { time, record })
}

/// Convert a decoded MessagePack value into its JSON counterpart.
/// Binary payloads render as lossy strings; extension types have no
/// JSON form and fail the conversion.
fn mp_to_json(value: rmpv::Value) -> Option<Value> {
    Some(match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::from(n)
            } else {
                Value::from(i.as_u64()?)
            }
        }
        rmpv::Value::F32(f) => Value::from(f as f64),
        rmpv::Value::F64(f) => Value::from(f),
        rmpv::Value::String(s) => Value::String(s.into_str()?),
        rmpv::Value::Binary(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
        rmpv::Value::Array(items) => {
            Value::Array(items.into_iter().map(mp_to_json).collect::<Option<_>>()?)
        }
        rmpv::Value::Map(entries) => {
            let mut map = Record::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    rmpv::Value::String(s) => s.into_str()?,
                    other => mp_to_json(other).map(|v| crate::record::value_to_string(&v))?,
                };
                map.insert(key, mp_to_json(value)?);
            }
            Value::Object(map)
        }
        rmpv::Value::Ext(..) => return None,
    })
}
