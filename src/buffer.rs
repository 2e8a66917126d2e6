//! Bounded in-memory trade buffer.
//!
//! The single source of truth for recent trades, independent of the
//! analytical store. Insertion order is time order per source; across
//! sources the ordering is only approximate and is never re-sorted.

use std::collections::VecDeque;

use crate::types::Trade;

/// FIFO ring of the most recent trades. Length never exceeds capacity;
/// eviction never reorders the remaining entries.
#[derive(Debug)]
pub struct TradeBuffer {
    trades: VecDeque<Trade>,
    capacity: usize,
}

impl TradeBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a trade, evicting from the front once at capacity. O(1)
    /// amortized. A zero-capacity buffer retains nothing: the trade is
    /// dropped rather than looping on an empty deque.
    pub fn push(&mut self, trade: Trade) {
        while self.trades.len() >= self.capacity {
            if self.trades.pop_front().is_none() {
                return;
            }
        }
        self.trades.push_back(trade);
    }

    /// All trades with `timestamp_ms >= cutoff_ms`, in insertion order.
    /// The fallback data source when the analytical store is unavailable.
    #[must_use]
    pub fn filter_since(&self, cutoff_ms: i64) -> Vec<Trade> {
        self.trades
            .iter()
            .filter(|t| t.timestamp_ms >= cutoff_ms)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Trade> {
        self.trades.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
