//! Queue payload types and the bounded plots queue.

use crate::driver::{Reading, RetValue};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One executed command, destined for the device's events dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Seconds since the run's `time_offset`.
    pub time: f64,
    pub command: String,
    /// Textual repr of the result; empty for `None` results.
    pub result: String,
}

impl Event {
    pub fn new(time: f64, command: impl Into<String>, result: &RetValue) -> Self {
        let result = match result {
            RetValue::None => String::new(),
            other => other.to_string(),
        };
        Self {
            time,
            command: command.into(),
            result,
        }
    }
}

/// Result of a periodic monitoring command, consumed by the monitor.
#[derive(Debug, Clone)]
pub struct MonitoringEvent {
    pub time: f64,
    pub command: String,
    pub result: RetValue,
}

/// Result of a sequencer-issued command, matched back by step id.
#[derive(Debug, Clone)]
pub struct SequencerEvent {
    pub id: u64,
    /// Epoch nanoseconds; kept integral so no precision is lost.
    pub time: u64,
    pub command: String,
    pub result: RetValue,
}

/// Fixed-capacity deque of the most recent readings.
///
/// When full, the oldest entry is dropped. Shrinking keeps the newest
/// entries; growing keeps everything.
pub struct PlotsQueue {
    inner: Mutex<PlotsQueueInner>,
}

struct PlotsQueueInner {
    buf: VecDeque<Arc<Reading>>,
    maxlen: usize,
}

impl PlotsQueue {
    pub fn new(maxlen: usize) -> Self {
        Self {
            inner: Mutex::new(PlotsQueueInner {
                buf: VecDeque::with_capacity(maxlen.min(1024)),
                maxlen: maxlen.max(1),
            }),
        }
    }

    pub fn push(&self, reading: Arc<Reading>) {
        let mut inner = self.inner.lock();
        while inner.buf.len() >= inner.maxlen {
            inner.buf.pop_front();
        }
        inner.buf.push_back(reading);
    }

    /// Change the capacity, keeping the most recent entries.
    pub fn resize(&self, maxlen: usize) {
        let mut inner = self.inner.lock();
        inner.maxlen = maxlen.max(1);
        while inner.buf.len() > inner.maxlen {
            inner.buf.pop_front();
        }
    }

    pub fn latest(&self) -> Option<Arc<Reading>> {
        self.inner.lock().buf.back().cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Reading>> {
        self.inner.lock().buf.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Reading;

    fn scalar(v: f64) -> Arc<Reading> {
        Arc::new(Reading::Scalar(v))
    }

    fn values(q: &PlotsQueue) -> Vec<f64> {
        q.snapshot()
            .iter()
            .map(|r| match **r {
                Reading::Scalar(v) => v,
                _ => panic!("expected scalar"),
            })
            .collect()
    }

    #[test]
    fn oldest_entries_fall_out_when_full() {
        let q = PlotsQueue::new(3);
        for i in 0..5 {
            q.push(scalar(i as f64));
        }
        assert_eq!(values(&q), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn shrinking_keeps_the_newest() {
        let q = PlotsQueue::new(5);
        for i in 0..5 {
            q.push(scalar(i as f64));
        }
        q.resize(2);
        assert_eq!(values(&q), vec![3.0, 4.0]);
        // growing keeps what is there
        q.resize(10);
        assert_eq!(values(&q), vec![3.0, 4.0]);
        q.push(scalar(5.0));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn event_result_reprs() {
        let e = Event::new(1.0, "SetOffset(6)", &RetValue::None);
        assert_eq!(e.result, "");
        let e = Event::new(1.0, "GetOffset()", &RetValue::Float(6.0));
        assert_eq!(e.result, "6.0");
    }
}
