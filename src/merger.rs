//! K-way merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::record::Record;

/// Binary heap k-way merger.
/// Merges multiple key-sorted inputs into a single key-sorted output holding every distinct key exactly once.
/// Values of records sharing a key, across and within inputs, are joined with a space in input order.
/// Time complexity is *m* \* log(*k*) where *m* is the number of records and *k* the number of inputs.
pub struct KWayMerger<E, C>
where
    C: IntoIterator<Item = Result<Record, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap;
    // ties on the key pop in input index order
    items: BinaryHeap<Reverse<(String, usize)>>,
    values: Vec<String>,
    chunks: Vec<C::IntoIter>,
    initiated: bool,
    merged: u64,
}

impl<E, C> KWayMerger<E, C>
where
    C: IntoIterator<Item = Result<Record, E>>,
{
    /// Creates an instance of a k-way merger using chunks as inputs.
    /// Chunk records should be sorted by key in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());
        let values = vec![String::new(); chunks.len()];

        return KWayMerger {
            chunks,
            items,
            values,
            initiated: false,
            merged: 0,
        };
    }

    /// Number of input records consumed so far.
    pub fn merged(&self) -> u64 {
        self.merged
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.chunks[idx].next() {
            let record = item?;
            self.merged += 1;
            self.values[idx] = record.value;
            self.items.push(Reverse((record.key, idx)));
        }
        return Ok(());
    }
}

impl<E, C> Iterator for KWayMerger<E, C>
where
    C: IntoIterator<Item = Result<Record, E>>,
{
    type Item = Result<Record, E>;

    /// Returns the next merged record in ascending key order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.pull(idx) {
                    return Some(Err(err));
                }
            }
        }

        let Reverse((key, idx)) = self.items.pop()?;
        let mut value = std::mem::take(&mut self.values[idx]);
        if let Err(err) = self.pull(idx) {
            return Some(Err(err));
        }

        while matches!(self.items.peek(), Some(Reverse((next_key, _))) if *next_key == key) {
            let Reverse((_, idx)) = match self.items.pop() {
                Some(item) => item,
                None => break,
            };

            let tied = std::mem::take(&mut self.values[idx]);
            if !tied.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(&tied);
            }

            if let Err(err) = self.pull(idx) {
                return Some(Err(err));
            }
        }

        return Some(Ok(Record { key, value }));
    }
}
