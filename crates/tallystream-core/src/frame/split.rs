// Delayed record splitting
//
// Some producers concatenate packed `[time, record]` pairs into one
// opaque blob inside the frame instead of sending a proper array. The
// blob is split by scanning for the fixed 3-byte prefix a packed pair
// starts with (fixarray-2 followed by a uint32 timestamp marker) and
// decoding each candidate slice independently.
//
// The scan is deliberately lenient: malformed sub-records are skipped
// so one corrupt entry never discards the rest of the batch. Upstream
// framing errors are common here; do not make this strict.

use serde_json::Value;

use super::mp_to_json;

/// Packed pair prefixes: 0x92 (fixarray of 2) then 0xCE (uint32) with
/// the leading timestamp byte of the realistic Unix-time range.
const PACKED_PREFIXES: [[u8; 3]; 3] = [[0x92, 0xCE, 0x55], [0x92, 0xCE, 0x56], [0x92, 0xCE, 0x57]];

fn is_boundary(window: &[u8]) -> bool {
    window.len() >= 3 && PACKED_PREFIXES.iter().any(|p| p == &window[..3])
}

/// Split a blob of concatenated packed records into decoded values.
pub fn split_packed(blob: &[u8]) -> Vec<Value> {
    let mut out = Vec::new();
    if blob.is_empty() {
        return out;
    }

    let mut start = 0usize;
    for i in 1..blob.len() {
        let is_end = i + 1 == blob.len();
        if is_end || is_boundary(&blob[i..]) {
            let candidate = if is_end { &blob[start..] } else { &blob[start..i] };
            if let Some(value) = decode_candidate(candidate) {
                out.push(value);
                if !is_end {
                    start = i;
                }
            }
            // Decode failures keep extending the candidate: the match
            // may have been record payload that merely looked like a
            // boundary.
        }
    }

    out
}

fn decode_candidate(bytes: &[u8]) -> Option<Value> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    mp_to_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Packs `[time, record]` the way upstream producers do, with the
    // timestamp encoded as uint32 so the boundary prefix appears.
    fn packed_pair(time: u32, record: &Value) -> Vec<u8> {
        let mut bytes = vec![0x92, 0xCE];
        bytes.extend_from_slice(&time.to_be_bytes());
        let record_bytes = rmp_serde::to_vec(record).unwrap();
        bytes.extend_from_slice(&record_bytes);
        bytes
    }

    // A Unix time whose top byte is 0x56 (2016..2018 era onwards).
    const T: u32 = 0x5601_0203;

    #[test]
    fn splits_concatenated_pairs() {
        let mut blob = packed_pair(T, &json!({"v": 1}));
        blob.extend(packed_pair(T + 1, &json!({"v": 2})));
        blob.extend(packed_pair(T + 2, &json!({"v": 3})));

        let records = split_packed(&blob);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], json!([T, {"v": 1}]));
        assert_eq!(records[2], json!([T + 2, {"v": 3}]));
    }

    #[test]
    fn single_pair_decodes_at_end_of_buffer() {
        let blob = packed_pair(T, &json!({"v": 9}));
        let records = split_packed(&blob);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], json!([T, {"v": 9}]));
    }

    #[test]
    fn garbage_between_pairs_is_skipped() {
        let mut blob = packed_pair(T, &json!({"ok": 1}));
        blob.extend([0xC1, 0xC1, 0xC1]);
        blob.extend(packed_pair(T + 1, &json!({"ok": 2})));
        blob.extend([0xC1, 0xC1]);

        let records = split_packed(&blob);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], json!([T, {"ok": 1}]));
        assert_eq!(records[1], json!([T + 1, {"ok": 2}]));
    }

    #[test]
    fn empty_blob_yields_nothing() {
        assert!(split_packed(&[]).is_empty());
    }
}
