use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Identifies a scheduled timer. Cancelling with a stale handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // BinaryHeap is a max-heap: the earliest deadline, then the lowest sequence,
    // must compare greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

struct Slot<T> {
    payload: T,
    interval: Option<Duration>,
}

/// A due timer taken out of the queue.
pub struct Due<T> {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub interval: Option<Duration>,
    pub payload: T,
}

/// Min-ordered timer queue.
///
/// Timers fire in ascending deadline order; equal deadlines fire in the order they
/// were scheduled. Every timer taken out by [`TimerQueue::pop_due`] stays in flight,
/// and cancellable, until [`TimerQueue::start_firing`] claims it. Periodic timers
/// stay in flight through their callback until [`TimerQueue::rearm`] puts them back.
pub struct TimerQueue<T> {
    heap: BinaryHeap<TimerEntry>,
    slots: HashMap<TimerHandle, Slot<T>>,
    in_flight: HashSet<TimerHandle>,
    next_handle: u64,
    next_sequence: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            in_flight: HashSet::new(),
            next_handle: 1,
            next_sequence: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, interval: Option<Duration>, payload: T) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.insert(handle, deadline, interval, payload);
        handle
    }

    fn insert(&mut self, handle: TimerHandle, deadline: Instant, interval: Option<Duration>, payload: T) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(TimerEntry {
            deadline,
            sequence,
            handle,
        });
        self.slots.insert(handle, Slot { payload, interval });
    }

    /// Cancels a pending or in-flight timer. An in-flight periodic timer that is
    /// already firing just stops rearming.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.slots.remove(&handle).is_some() || self.in_flight.remove(&handle)
    }

    /// Earliest live deadline. Drops heap entries of cancelled timers on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.slots.contains_key(&entry.handle) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes every timer due at `now`, in firing order, and marks them in flight.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Due<T>> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            let Some(slot) = self.slots.remove(&entry.handle) else {
                continue;
            };
            self.in_flight.insert(entry.handle);
            due.push(Due {
                handle: entry.handle,
                deadline: entry.deadline,
                interval: slot.interval,
                payload: slot.payload,
            });
        }
        due
    }

    /// Whether a due timer is still live and should run now. A one-shot timer stops
    /// being cancellable at this point.
    pub fn start_firing(&mut self, due: &Due<T>) -> bool {
        if due.interval.is_some() {
            self.in_flight.contains(&due.handle)
        } else {
            self.in_flight.remove(&due.handle)
        }
    }

    /// Reschedules a fired periodic timer unless it was cancelled while in flight.
    pub fn rearm(&mut self, handle: TimerHandle, now: Instant, interval: Duration, payload: T) -> bool {
        if !self.in_flight.remove(&handle) {
            return false;
        }
        self.insert(handle, now + interval, Some(interval), payload);
        true
    }

    /// Puts back a due timer that was not fired, keeping its original deadline.
    /// Timers cancelled while in flight are dropped instead.
    pub fn restore(&mut self, due: Due<T>) -> bool {
        if !self.in_flight.remove(&due.handle) {
            return false;
        }
        self.insert(due.handle, due.deadline, due.interval, due.payload);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
