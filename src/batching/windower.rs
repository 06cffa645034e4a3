// Fixed-size batch windowing with leftover carry-over
//
// Records pushed in are appended to the leftover from earlier pushes and sliced into
// batches of exactly `size`. The under-full tail waits for the next push.

use std::ops::Range;

use crate::errors::{PipelineError, PipelineResult};

/// An ordered group of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<R> {
    pub records: Vec<R>,
    /// Stream positions covered, half-open.
    pub range: Range<u64>,
}

impl<R> Batch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What to do with the leftover when the stream ends for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfStream {
    /// Drop the under-full tail.
    Discard,
    /// Emit the tail as a short terminal batch.
    Flush,
}

#[derive(Debug)]
pub struct BatchWindower<R> {
    size: usize,
    leftover: Vec<R>,
    /// Stream position of `leftover[0]`.
    position: u64,
}

impl<R> BatchWindower<R> {
    pub fn new(size: usize) -> PipelineResult<Self> {
        if size == 0 {
            return Err(PipelineError::config("batch size must be at least 1"));
        }
        Ok(Self {
            size,
            leftover: Vec::with_capacity(size),
            position: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Records waiting for the next push.
    pub fn leftover(&self) -> &[R] {
        &self.leftover
    }

    /// Stream position of the next record to be pushed.
    pub fn next_position(&self) -> u64 {
        self.position + self.leftover.len() as u64
    }

    /// Append records and return every batch that is now full.
    pub fn push(&mut self, records: impl IntoIterator<Item = R>) -> Vec<Batch<R>> {
        self.leftover.extend(records);

        let full = self.leftover.len() / self.size;
        if full == 0 {
            return Vec::new();
        }

        let tail = self.leftover.split_off(full * self.size);
        let ready = std::mem::replace(&mut self.leftover, tail);

        let mut records = ready.into_iter();
        let mut batches = Vec::with_capacity(full);
        for _ in 0..full {
            let start = self.position;
            self.position += self.size as u64;
            batches.push(Batch {
                records: records.by_ref().take(self.size).collect(),
                range: start..self.position,
            });
        }
        batches
    }

    /// Drop the leftover without ending the stream; returns what was dropped.
    pub fn reset(&mut self) -> Vec<R> {
        let dropped = std::mem::take(&mut self.leftover);
        self.position += dropped.len() as u64;
        dropped
    }

    /// End of stream: flush the leftover as a short batch, or discard it.
    pub fn finish(&mut self, end: EndOfStream) -> Option<Batch<R>> {
        if self.leftover.is_empty() {
            return None;
        }
        match end {
            EndOfStream::Discard => {
                let dropped = self.reset();
                tracing::debug!(dropped = dropped.len(), "Discarded leftover at end of stream");
                None
            }
            EndOfStream::Flush => {
                let start = self.position;
                let records = std::mem::take(&mut self.leftover);
                self.position += records.len() as u64;
                Some(Batch {
                    records,
                    range: start..self.position,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(range: Range<u32>) -> Vec<String> {
        range.map(|i| format!("R{}", i)).collect()
    }

    #[test]
    fn test_nine_records_in_fours() {
        let mut windower = BatchWindower::new(4).unwrap();
        let batches = windower.push(names(1..10));

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].records, names(1..5));
        assert_eq!(batches[0].range, 0..4);
        assert_eq!(batches[1].records, names(5..9));
        assert_eq!(batches[1].range, 4..8);
        assert_eq!(windower.leftover(), names(9..10).as_slice());
    }

    #[test]
    fn test_fewer_than_size_emits_nothing() {
        let mut windower = BatchWindower::new(4).unwrap();
        assert!(windower.push(names(1..4)).is_empty());
        assert_eq!(windower.leftover().len(), 3);
    }

    #[test]
    fn test_leftover_precedes_new_records() {
        let mut windower = BatchWindower::new(3).unwrap();
        assert!(windower.push(vec![1, 2]).is_empty());

        let batches = windower.push(vec![3, 4, 5, 6, 7]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].records, vec![1, 2, 3]);
        assert_eq!(batches[1].records, vec![4, 5, 6]);
        assert_eq!(batches[1].range, 3..6);
        assert_eq!(windower.leftover(), &[7]);
    }

    #[test]
    fn test_conservation_across_uneven_pushes() {
        let size = 5;
        let mut windower = BatchWindower::new(size).unwrap();
        let mut emitted = Vec::new();
        let mut next = 0u32;

        for push_len in [0, 1, 7, 3, 12, 4, 4, 1, 9] {
            let records: Vec<u32> = (next..next + push_len).collect();
            next += push_len;
            for batch in windower.push(records) {
                assert_eq!(batch.len(), size);
                assert_eq!(batch.range.end - batch.range.start, size as u64);
                emitted.extend(batch.records);
            }
            assert!(windower.leftover().len() < size);
        }

        let total = next as usize;
        assert_eq!(emitted.len() + windower.leftover().len(), total);

        let mut all = emitted.clone();
        all.extend_from_slice(windower.leftover());
        assert_eq!(all, (0..next).collect::<Vec<_>>());
    }

    #[test]
    fn test_finish_discard_and_flush() {
        let mut windower = BatchWindower::new(4).unwrap();
        windower.push(names(1..10));
        assert_eq!(windower.finish(EndOfStream::Discard), None);
        assert!(windower.leftover().is_empty());

        let mut windower = BatchWindower::new(4).unwrap();
        windower.push(names(1..10));
        let last = windower.finish(EndOfStream::Flush).unwrap();
        assert_eq!(last.records, names(9..10));
        assert_eq!(last.range, 8..9);
        assert_eq!(windower.finish(EndOfStream::Flush), None);
    }

    #[test]
    fn test_reset_keeps_positions_monotonic() {
        let mut windower = BatchWindower::new(2).unwrap();
        windower.push(vec!['a', 'b', 'c']);
        assert_eq!(windower.reset(), vec!['c']);
        assert_eq!(windower.next_position(), 3);

        let batches = windower.push(vec!['d', 'e']);
        assert_eq!(batches[0].records, vec!['d', 'e']);
        assert_eq!(batches[0].range, 3..5);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            BatchWindower::<u8>::new(0),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }
}
