use std::collections::BTreeMap;

use crate::asn::is_reserved;

use super::worker::PartialCount;

/// The two aggregation passes of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Prefixes the ASN announces.
    Origin,
    /// Prefixes the ASN carries as an intermediate hop.
    Transit,
}

impl Pass {
    pub const ALL: [Pass; 2] = [Pass::Origin, Pass::Transit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::Transit => "transit",
        }
    }
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distinct prefix counts for one ASN, per role and IP version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixCountRecord {
    pub origin_v4: u64,
    pub origin_v6: u64,
    pub transit_v4: u64,
    pub transit_v6: u64,
}

impl PrefixCountRecord {
    pub fn is_origin(&self) -> bool {
        self.origin_v4 > 0 || self.origin_v6 > 0
    }

    pub fn is_transit(&self) -> bool {
        self.transit_v4 > 0 || self.transit_v6 > 0
    }

    /// Overwrites the fields owned by `pass`, leaving the other pass untouched.
    pub fn set(&mut self, pass: Pass, v4: u64, v6: u64) {
        match pass {
            Pass::Origin => {
                self.origin_v4 = v4;
                self.origin_v6 = v6;
            }
            Pass::Transit => {
                self.transit_v4 = v4;
                self.transit_v6 = v6;
            }
        }
    }
}

/// Run-scoped map of ASN to merged prefix counts.
///
/// Only the scheduler's draining task mutates it; worker tasks never see it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    records: BTreeMap<u32, PrefixCountRecord>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an all-zero record for every non-reserved ASN not yet present.
    pub fn seed(&mut self, asns: impl IntoIterator<Item = u32>) {
        for asn in asns {
            if !is_reserved(asn) {
                self.records.entry(asn).or_default();
            }
        }
    }

    /// Folds one batch's partial result into the accumulator.
    ///
    /// Field-wise overwrite makes the result independent of pass order and of
    /// batch completion order.
    pub fn merge(&mut self, pass: Pass, partial: &[PartialCount]) {
        for p in partial {
            if is_reserved(p.asn) {
                continue;
            }
            self.records
                .entry(p.asn)
                .or_default()
                .set(pass, p.v4, p.v6);
        }
    }

    pub fn get(&self, asn: u32) -> Option<&PrefixCountRecord> {
        self.records.get(&asn)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates records in ascending ASN order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &PrefixCountRecord)> {
        self.records.iter().map(|(asn, rec)| (*asn, rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc(asn: u32, v4: u64, v6: u64) -> PartialCount {
        PartialCount { asn, v4, v6 }
    }

    #[test]
    fn test_new_asn_defaults_other_pass_to_zero() {
        let mut acc = Accumulator::new();
        acc.merge(Pass::Transit, &[pc(300, 5, 0)]);

        let rec = acc.get(300).copied().unwrap_or_default();
        assert_eq!(
            rec,
            PrefixCountRecord {
                origin_v4: 0,
                origin_v6: 0,
                transit_v4: 5,
                transit_v6: 0,
            }
        );
        assert!(rec.is_transit());
        assert!(!rec.is_origin());
    }

    #[test]
    fn test_existing_asn_keeps_other_pass_fields() {
        let mut acc = Accumulator::new();
        acc.merge(Pass::Origin, &[pc(100, 3, 1)]);
        acc.merge(Pass::Transit, &[pc(100, 0, 2)]);

        let rec = acc.get(100).copied().unwrap_or_default();
        assert_eq!(rec.origin_v4, 3);
        assert_eq!(rec.origin_v6, 1);
        assert_eq!(rec.transit_v4, 0);
        assert_eq!(rec.transit_v6, 2);
        assert!(rec.is_origin());
        assert!(rec.is_transit());
    }

    #[test]
    fn test_merge_commutative_across_passes() {
        let origin = vec![pc(1, 10, 2), pc(2, 0, 4), pc(5, 9, 9)];
        let transit = vec![pc(2, 7, 0), pc(3, 1, 1), pc(5, 0, 0)];

        let mut forward = Accumulator::new();
        forward.merge(Pass::Origin, &origin);
        forward.merge(Pass::Transit, &transit);

        let mut reverse = Accumulator::new();
        reverse.merge(Pass::Transit, &transit);
        reverse.merge(Pass::Origin, &origin);

        assert_eq!(forward, reverse);
        assert_eq!(forward.len(), 4);
    }

    #[test]
    fn test_merge_independent_of_batch_completion_order() {
        let batches = [vec![pc(1, 1, 0), pc(2, 2, 0)], vec![pc(3, 3, 3)], vec![pc(4, 0, 4)]];

        let mut in_order = Accumulator::new();
        for b in &batches {
            in_order.merge(Pass::Origin, b);
        }

        let mut shuffled = Accumulator::new();
        for idx in [2, 0, 1] {
            shuffled.merge(Pass::Origin, &batches[idx]);
        }

        assert_eq!(in_order, shuffled);
    }

    #[test]
    fn test_seed_creates_zero_records_and_skips_reserved() {
        let mut acc = Accumulator::new();
        acc.seed([100, 200, 23456, 300]);
        assert_eq!(acc.len(), 3);
        assert_eq!(acc.get(200), Some(&PrefixCountRecord::default()));
        assert!(acc.get(23456).is_none());

        // Seeding again never clobbers merged values.
        acc.merge(Pass::Origin, &[pc(100, 3, 1)]);
        acc.seed([100]);
        assert_eq!(acc.get(100).map(|r| r.origin_v4), Some(3));
    }

    #[test]
    fn test_reserved_asn_in_partial_ignored() {
        let mut acc = Accumulator::new();
        acc.merge(Pass::Origin, &[pc(0, 1, 1), pc(64_512, 1, 1), pc(42, 1, 0)]);
        assert_eq!(acc.len(), 1);
        assert!(acc.get(42).is_some());
    }

    #[test]
    fn test_iter_ascending() {
        let mut acc = Accumulator::new();
        acc.merge(Pass::Origin, &[pc(30, 1, 0), pc(10, 1, 0), pc(20, 1, 0)]);
        let asns: Vec<u32> = acc.iter().map(|(asn, _)| asn).collect();
        assert_eq!(asns, vec![10, 20, 30]);
    }
}
