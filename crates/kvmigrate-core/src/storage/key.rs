//! Order-preserving key encodings.

/// Size of an encoded sequence key in bytes.
pub const SEQUENCE_KEY_SIZE: usize = 8;

/// Encode a sequence number as a fixed-width key.
///
/// Big-endian encoding ensures lexicographic ordering matches numeric ordering,
/// so range scans return sequence numbers in ascending order.
pub fn encode_sequence(sequence: u64) -> [u8; SEQUENCE_KEY_SIZE] {
    sequence.to_be_bytes()
}

/// Decode a fixed-width sequence key.
pub fn decode_sequence(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; SEQUENCE_KEY_SIZE] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Build a composite key: `[len(first) u32 BE][first][second]`.
///
/// The length prefix makes `first` an unambiguous prefix, so all keys sharing
/// `first` are contiguous and no other `first` can collide with them.
pub fn encode_composite(first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + first.len() + second.len());
    key.extend_from_slice(&composite_prefix(first));
    key.extend_from_slice(second);
    key
}

/// The scan prefix covering every composite key whose first part is `first`.
pub fn composite_prefix(first: &[u8]) -> Vec<u8> {
    let len = u32::try_from(first.len()).unwrap_or(u32::MAX);
    let mut prefix = Vec::with_capacity(4 + first.len());
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(first);
    prefix
}

/// Split a composite key back into its two parts.
pub fn decode_composite(key: &[u8]) -> Option<(&[u8], &[u8])> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let rest = key.get(4..)?;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
