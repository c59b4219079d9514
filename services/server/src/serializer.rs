// Restores request-issue order over asynchronous completions.
//
// Responses carry the ordinal assigned when their request was dispatched;
// completions may arrive in any order. A response whose ordinal matches the
// next expected number goes straight to the wire; anything later parks in a
// min-heap until the gap in front of it fills.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use anyhow::{Result, bail};
use bytes::Bytes;

struct PendingWrite {
    order: i64,
    buf: Bytes,
}

impl PartialEq for PendingWrite {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for PendingWrite {}

impl PartialOrd for PendingWrite {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingWrite {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order.cmp(&other.order)
    }
}

pub struct ResponseSerializer {
    expected_resp_no: i64,
    pending: BinaryHeap<Reverse<PendingWrite>>,
}

impl Default for ResponseSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSerializer {
    pub fn new() -> Self {
        Self {
            expected_resp_no: 0,
            pending: BinaryHeap::new(),
        }
    }

    /// Submit a completed response. Returns the buffers now eligible for the
    /// wire, in issue order; parks the response if earlier ordinals are
    /// still outstanding. Wrap of the expected ordinal is fatal.
    pub fn submit(&mut self, order: i64, buf: Bytes) -> Result<Vec<Bytes>> {
        let mut ready = Vec::new();
        if order == self.expected_resp_no {
            ready.push(buf);
            self.advance()?;
        } else {
            // Completions never rewind: an ordinal below expected would mean
            // a duplicate completion.
            debug_assert!(order > self.expected_resp_no);
            self.pending.push(Reverse(PendingWrite { order, buf }));
        }
        while let Some(Reverse(head)) = self.pending.peek() {
            if head.order != self.expected_resp_no {
                break;
            }
            let Some(Reverse(head)) = self.pending.pop() else {
                break;
            };
            ready.push(head.buf);
            self.advance()?;
        }
        Ok(ready)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn advance(&mut self) -> Result<()> {
        self.expected_resp_no = self.expected_resp_no.wrapping_add(1);
        if self.expected_resp_no == i64::MIN {
            bail!("long wrapped!");
        }
        Ok(())
    }
}
