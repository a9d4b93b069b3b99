use alloc::{boxed::Box, collections::VecDeque, vec::Vec};

use tracing::warn;

/// The queue of application payloads awaiting anonymous transmission.
///
/// Delivery is tied to round success: a [`get`](`Self::get`) marks a rewind
/// point instead of dropping data, and the drained prefix is only discarded
/// by the next `get`, or resurrected by [`unget`](`Self::unget`) when the
/// round it rode on failed. The queue itself survives epoch restarts.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<Box<[u8]>>,
    trim: usize,
}

impl SendQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload.
    pub fn add(&mut self, data: Box<[u8]>) {
        self.queue.push_back(data);
    }

    /// Drains a prefix of queued payloads whose concatenated size fits in
    /// `max` bytes, and reports whether more data is waiting.
    ///
    /// Individual payloads larger than `max` can never be delivered and are
    /// skipped with a warning. The drained prefix is committed only by the
    /// next call; see [`unget`](`Self::unget`).
    pub fn get(&mut self, max: usize) -> (Box<[u8]>, bool) {
        if self.trim > 0 {
            self.queue.drain(..self.trim);
            self.trim = 0;
        }

        let mut data = Vec::new();
        let mut index = 0;
        while index < self.queue.len() {
            let item = &self.queue[index];
            if item.len() > max {
                warn!(size = item.len(), max, "queued payload exceeds the chunk size, skipping it");
                index += 1;
                continue;
            }
            if data.len() + item.len() > max {
                break;
            }
            data.extend_from_slice(item);
            index += 1;
        }

        self.trim = index;
        let more = self.queue.len() != self.trim;
        (data.into_boxed_slice(), more)
    }

    /// Rewinds to the last rewind point: the prefix handed out by the
    /// previous [`get`](`Self::get`) will be handed out again.
    pub fn unget(&mut self) {
        self.trim = 0;
    }

    /// The number of queued payloads, the uncommitted prefix included.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    use super::SendQueue;

    fn filled(items: &[&[u8]]) -> SendQueue {
        let mut queue = SendQueue::new();
        for item in items {
            queue.add(Box::from(*item));
        }
        queue
    }

    #[test]
    fn drains_a_prefix_up_to_the_limit() {
        let mut queue = filled(&[b"aaaa", b"bbbb", b"cccc"]);
        let (data, more) = queue.get(9);
        assert_eq!(data.as_ref(), b"aaaabbbb");
        assert!(more);
        let (data, more) = queue.get(9);
        assert_eq!(data.as_ref(), b"cccc");
        assert!(!more);
    }

    #[test]
    fn unget_replays_the_same_prefix() {
        let mut queue = filled(&[b"aaaa", b"bbbb", b"cccc"]);
        let (first, _) = queue.get(9);
        queue.unget();
        let (second, _) = queue.get(9);
        assert_eq!(first, second);
        // Without a rewind the prefix is committed.
        let (third, _) = queue.get(9);
        assert_eq!(third.as_ref(), b"cccc");
    }

    #[test]
    fn delivery_is_a_gap_free_prefix_across_failures() {
        // Interleave gets, failures (unget) and new data; everything that
        // comes out must be the insertion-order stream, no gaps, no repeats.
        let items: Vec<Box<[u8]>> = (0u8..20).map(|byte| Box::from([byte, byte])).collect();
        let mut queue = SendQueue::new();
        let mut delivered = Vec::new();

        for (index, item) in items.iter().enumerate() {
            queue.add(item.clone());
            let (chunk, _) = queue.get(5);
            if index % 3 == 0 {
                // The round this chunk rode on failed.
                queue.unget();
            } else {
                delivered.extend_from_slice(&chunk);
            }
        }
        // Drain the rest, committing as we go.
        loop {
            let (chunk, more) = queue.get(5);
            delivered.extend_from_slice(&chunk);
            if chunk.is_empty() && !more {
                break;
            }
        }

        let expected: Vec<u8> = items.iter().flat_map(|item| item.iter().copied()).collect();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn oversized_items_are_skipped() {
        let mut queue = filled(&[b"toolarge!", b"ab"]);
        let (data, more) = queue.get(4);
        assert_eq!(data.as_ref(), b"ab");
        assert!(!more);
        // The oversized item is gone for good at the next commit.
        let (data, _) = queue.get(4);
        assert!(data.is_empty());
    }
}
