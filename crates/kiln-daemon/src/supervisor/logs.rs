use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::broadcast::{Broadcaster, HubEvent, Replay};

#[derive(Debug)]
struct Ring {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

/// Bounded log history of one supervised process. Oldest lines are evicted first.
///
/// Only the process' reader tasks write (through the broadcaster); any number of readers
/// may take snapshots concurrently.
#[derive(Debug)]
pub struct LogBuffer {
    ring: Mutex<Ring>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                next_seq: 1,
                max_lines: max_lines.max(1),
                lines: VecDeque::new(),
            }),
        }
    }

    pub fn push_line(&self, line: String) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let seq = ring.next_seq;
        ring.next_seq = ring.next_seq.saturating_add(1);
        ring.lines.push_back((seq, line));
        while ring.lines.len() > ring.max_lines {
            ring.lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.lines.iter().map(|(_, l)| l.clone()).collect()
    }

    /// Lines with a sequence number above `cursor`, at most `limit`, plus the new cursor.
    /// A zero cursor returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if cursor == 0 {
            let start = ring.lines.len().saturating_sub(limit);
            let mut last = 0;
            let out = ring
                .lines
                .iter()
                .skip(start)
                .map(|(seq, line)| {
                    last = *seq;
                    line.clone()
                })
                .collect();
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in ring.lines.iter().filter(|(seq, _)| *seq > cursor) {
            out.push(line.clone());
            last = *seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }

    /// Sequence number of the newest line, `0` when nothing was ever written.
    pub fn last_seq(&self) -> u64 {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.next_seq.saturating_sub(1)
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.lines.clear();
    }

    pub fn set_max_lines(&self, max_lines: usize) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.max_lines = max_lines.max(1);
        while ring.lines.len() > ring.max_lines {
            ring.lines.pop_front();
        }
    }
}

impl Replay for LogBuffer {
    fn record(&self, event: &HubEvent) {
        if let HubEvent::Log { line } = event {
            self.push_line(line.clone());
        }
    }

    fn replay(&self) -> Vec<HubEvent> {
        self.snapshot()
            .into_iter()
            .map(|line| HubEvent::Log { line })
            .collect()
    }
}

/// Where a process' output goes: its ring buffer (via the group source) and the group's
/// live subscribers.
#[derive(Clone)]
pub struct LogSink {
    hub: Arc<Broadcaster>,
    group: String,
}

impl LogSink {
    /// Binds `buffer` as the replay source of `group`.
    pub fn attach(hub: Arc<Broadcaster>, group: String, buffer: Arc<LogBuffer>) -> Self {
        hub.attach(&group, buffer);
        Self { hub, group }
    }

    pub fn emit(&self, line: impl Into<String>) {
        self.hub.publish(
            &self.group,
            HubEvent::Log {
                line: line.into(),
            },
        );
    }

    pub fn state(&self, state: &str) {
        self.hub.publish(
            &self.group,
            HubEvent::State {
                state: state.to_string(),
            },
        );
    }
}
