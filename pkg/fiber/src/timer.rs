//! Per-scheduler timer manager.
//!
//! An ordered map from absolute millisecond deadline to coroutine id. A
//! monotonically increasing sequence number disambiguates equal deadlines and
//! preserves insertion order among them, so ties fire FIFO.

use std::collections::BTreeMap;

/// Handle to one pending timer: `(deadline_ms, seq)`. Stored on the owning
/// coroutine so the timer can be cancelled when the coroutine is resumed by
/// another source first.
pub(crate) type TimerId = (i64, u64);

pub(crate) struct TimerManager {
    timers: BTreeMap<TimerId, u32>,
    seq: u64,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            timers: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn add(&mut self, deadline_ms: i64, co_id: u32) -> TimerId {
        self.seq += 1;
        let id = (deadline_ms, self.seq);
        self.timers.insert(id, co_id);
        id
    }

    pub fn del(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Removes and returns the earliest entry whose deadline has passed.
    pub fn pop_expired(&mut self, now_ms: i64) -> Option<(TimerId, u32)> {
        let (&id, _) = self.timers.first_key_value()?;
        if id.0 > now_ms {
            return None;
        }
        let co = self.timers.remove(&id).unwrap();
        Some((id, co))
    }

    /// Milliseconds until the earliest pending deadline, or `None` when no
    /// timer is armed (the poller then waits indefinitely). Never returns a
    /// value that would sleep past the earliest deadline.
    pub fn next_delay(&self, now_ms: i64) -> Option<u64> {
        let (&(deadline, _), _) = self.timers.first_key_value()?;
        Some(deadline.saturating_sub(now_ms).max(0) as u64)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_order_is_deadline_then_insertion() {
        let mut tm = TimerManager::new();
        tm.add(20, 1);
        tm.add(10, 2);
        tm.add(10, 3); // same deadline as co 2, inserted later
        tm.add(30, 4);

        let mut fired = Vec::new();
        while let Some((_, co)) = tm.pop_expired(25) {
            fired.push(co);
        }
        assert_eq!(fired, vec![2, 3, 1]);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn del_cancels() {
        let mut tm = TimerManager::new();
        let a = tm.add(5, 1);
        tm.add(6, 2);
        tm.del(a);

        assert_eq!(tm.pop_expired(10).map(|(_, co)| co), Some(2));
        assert!(tm.pop_expired(10).is_none());
    }

    #[test]
    fn wait_hint_never_overshoots() {
        let mut tm = TimerManager::new();
        assert_eq!(tm.next_delay(100), None);

        tm.add(150, 1);
        assert_eq!(tm.next_delay(100), Some(50));
        // A deadline already in the past asks for an immediate poll.
        assert_eq!(tm.next_delay(200), Some(0));
    }
}
