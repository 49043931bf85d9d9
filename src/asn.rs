//! Autonomous System Number helpers.

/// AS_TRANS, the 2-byte placeholder for 4-byte ASNs (RFC 6793).
pub const AS_TRANS: u32 = 23456;

/// First ASN of the 32-bit private-use block (RFC 6996).
pub const PRIVATE_32BIT_START: u32 = 4_200_000_000;

/// Returns true for ASNs that never appear in the statistics.
///
/// Covers 0, AS_TRANS, the 16-bit documentation/private/last range
/// (64496-65535), the reserved 65536-131071 block and the 32-bit private
/// block and above.
pub fn is_reserved(asn: u32) -> bool {
    matches!(
        asn,
        0 | AS_TRANS | 64_496..=65_535 | 65_536..=131_071 | PRIVATE_32BIT_START..=u32::MAX
    )
}

/// Renders ASNs as a comma-separated SQL list.
pub fn join_list(asns: &[u32]) -> String {
    let mut out = String::with_capacity(asns.len() * 8);
    for (idx, asn) in asns.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&asn.to_string());
    }
    out
}
