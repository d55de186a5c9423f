//! CRC-32 (IEEE) integrity check over message payloads.

/// Compute the CRC-32 (IEEE polynomial) of `payload`.
pub fn compute(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Returns `true` if `claimed` is the CRC-32 of `payload`.
pub fn verify(payload: &[u8], claimed: u32) -> bool {
    compute(payload) == claimed
}
