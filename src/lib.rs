//! Per-ASN origin and transit prefix statistics.
//!
//! Fetches the active ASN universe, counts distinct origin and transit
//! prefixes per ASN with batched grouped queries over a fixed worker pool,
//! and persists the merged counts as deduplicated timestamped snapshots.

pub mod asn;
pub mod config;
pub mod export;
pub mod migrate;
pub mod pipeline;
pub mod store;
