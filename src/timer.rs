//! Timer (spec §4.9): an ordered set of deadlines keyed by monotonic time,
//! each carrying a callback token understood by the owner (`Server`).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct Entry {
    callback: TimerCallback,
    interval: Option<Duration>,
}

/// What a fired timer means to the server — kept as plain data instead of a
/// boxed closure so the timer module never needs to know about `Client`,
/// `Poll`, or any other server-owned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCallback {
    CgiTimeout(mio::Token),
    HangCheck,
}

#[derive(Default)]
pub struct Timer {
    deadlines: BTreeMap<(Instant, TimerId), ()>,
    entries: std::collections::HashMap<TimerId, (Instant, Entry)>,
    next_id: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, delay: Duration, callback: TimerCallback, recurring: bool) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = Instant::now() + delay;
        self.deadlines.insert((deadline, id), ());
        self.entries.insert(
            id,
            (
                deadline,
                Entry {
                    callback,
                    interval: recurring.then_some(delay),
                },
            ),
        );
        id
    }

    pub fn delete_event(&mut self, id: TimerId) {
        if let Some((deadline, _)) = self.entries.remove(&id) {
            self.deadlines.remove(&(deadline, id));
        }
    }

    /// Milliseconds until the soonest deadline, or `-1` if none are pending —
    /// directly usable as a `Poller::wait` timeout.
    pub fn next_timeout_ms(&self) -> i64 {
        match self.deadlines.keys().next() {
            None => -1,
            Some((deadline, _)) => {
                let now = Instant::now();
                if *deadline <= now {
                    0
                } else {
                    (*deadline - now).as_millis() as i64
                }
            }
        }
    }

    /// Invokes every callback whose deadline has passed. Recurring events are
    /// rescheduled to `max(now, prev_deadline + interval)` so a main loop
    /// that fell behind doesn't tight-fire a backlog of catch-up events.
    pub fn process_expired(&mut self) -> Vec<TimerCallback> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let expired: Vec<(Instant, TimerId)> = self
            .deadlines
            .range(..=(now, TimerId(u64::MAX)))
            .map(|(k, _)| *k)
            .collect();

        for (deadline, id) in expired {
            self.deadlines.remove(&(deadline, id));
            let Some((stored_deadline, entry)) = self.entries.get_mut(&id) else {
                continue;
            };
            fired.push(entry.callback);
            match entry.interval {
                Some(interval) => {
                    let next_deadline = std::cmp::max(now, deadline + interval);
                    *stored_deadline = next_deadline;
                    self.deadlines.insert((next_deadline, id), ());
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_timeout_reflects_soonest_deadline() {
        let mut t = Timer::new();
        assert_eq!(t.next_timeout_ms(), -1);
        t.add_event(Duration::from_secs(10), TimerCallback::HangCheck, false);
        t.add_event(Duration::from_millis(1), TimerCallback::HangCheck, false);
        assert!(t.next_timeout_ms() <= 10);
    }

    #[test]
    fn delete_event_prevents_firing() {
        let mut t = Timer::new();
        let id = t.add_event(Duration::from_millis(0), TimerCallback::HangCheck, false);
        t.delete_event(id);
        assert!(t.process_expired().is_empty());
    }

    #[test]
    fn expired_events_fire_once_when_not_recurring() {
        let mut t = Timer::new();
        t.add_event(Duration::from_millis(0), TimerCallback::HangCheck, false);
        std::thread::sleep(Duration::from_millis(2));
        let fired = t.process_expired();
        assert_eq!(fired.len(), 1);
        assert!(t.process_expired().is_empty());
    }
}
