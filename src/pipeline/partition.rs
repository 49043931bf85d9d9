use crate::asn::{self, is_reserved};

/// A group of ASNs queried together in one aggregation statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Position of the batch within its pass, starting at 0.
    pub index: usize,
    pub asns: Vec<u32>,
}

impl Batch {
    /// Comma-separated ASN list for an `IN (...)` clause.
    pub fn asn_list(&self) -> String {
        asn::join_list(&self.asns)
    }

    pub fn len(&self) -> usize {
        self.asns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asns.is_empty()
    }
}

/// Splits an ordered ASN list into fixed-size batches.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    batch_size: usize,
}

impl Partitioner {
    /// Creates a partitioner. A zero batch size is treated as 1.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Lazily yields batches in input order, skipping reserved ASNs.
    ///
    /// The trailing partial batch is always emitted.
    pub fn batches<'a>(&self, asns: &'a [u32]) -> Batches<'a> {
        Batches {
            asns: asns.iter(),
            batch_size: self.batch_size,
            next_index: 0,
        }
    }
}

/// Iterator returned by [`Partitioner::batches`].
pub struct Batches<'a> {
    asns: std::slice::Iter<'a, u32>,
    batch_size: usize,
    next_index: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let mut asns = Vec::with_capacity(self.batch_size);

        for &asn in self.asns.by_ref() {
            if is_reserved(asn) {
                continue;
            }

            asns.push(asn);
            if asns.len() == self.batch_size {
                break;
            }
        }

        if asns.is_empty() {
            return None;
        }

        let batch = Batch {
            index: self.next_index,
            asns,
        };
        self.next_index += 1;

        Some(batch)
    }
}
