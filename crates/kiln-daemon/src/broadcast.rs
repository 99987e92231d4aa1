//! Group-keyed publish/subscribe used for log lines and job progress.
//!
//! Every subscriber connection owns one bounded channel. A group may carry a replay
//! source (a log ring buffer, a cached job status); joining sends the replay and
//! registers the subscriber under the same lock that publishing takes, so a joiner sees
//! every event exactly once: either in the replay or live.
//!
//! Publishing never waits. A subscriber whose channel is full stops receiving from every
//! group and its `evicted` token fires so the connection can be closed.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use kiln_process::{InstanceId, TunnelId};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

pub type SubscriberId = u64;

/// Events a subscriber may have queued before it counts as too slow.
pub const SUBSCRIBER_CAPACITY: usize = 1024;

pub fn instance_group(id: InstanceId) -> String {
    format!("instance:{id}")
}

pub fn tunnel_group(id: TunnelId) -> String {
    format!("tunnel:{id}")
}

pub fn job_group(id: u32) -> String {
    format!("job:{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Log {
        line: String,
    },
    Progress {
        percent: u8,
        message: String,
        done: bool,
        success: bool,
    },
    State {
        state: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub group: String,
    pub event: HubEvent,
}

/// History kept on behalf of a group and replayed to new subscribers.
pub trait Replay: Send + Sync {
    /// Called for every event published to the group, under the registry lock.
    fn record(&self, event: &HubEvent);
    fn replay(&self) -> Vec<HubEvent>;
}

/// One connection's handle into the broadcaster. Clones share the channel.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Delivery>,
    evicted: CancellationToken,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Fires once the subscriber fell behind and was dropped from its groups.
    pub fn evicted(&self) -> CancellationToken {
        self.evicted.clone()
    }

    /// Delivers without waiting. A full channel evicts; a closed one just reports
    /// failure.
    fn offer(&self, group: &str, event: HubEvent) -> bool {
        if self.evicted.is_cancelled() {
            return false;
        }
        match self.tx.try_send(Delivery {
            group: group.to_string(),
            event,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = self.id, group, "subscriber fell behind, evicting");
                self.evicted.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct Group {
    subscribers: Vec<Subscriber>,
    source: Option<Arc<dyn Replay>>,
}

impl Group {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.source.is_none()
    }
}

#[derive(Default)]
pub struct Broadcaster {
    groups: Mutex<HashMap<String, Group>>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster").finish_non_exhaustive()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a subscriber whose channel holds up to `capacity` undelivered events.
    pub fn subscribe(&self, capacity: usize) -> (Subscriber, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Subscriber {
            id: self.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1,
            tx,
            evicted: CancellationToken::new(),
        };
        (subscriber, rx)
    }

    /// Installs (or replaces) the replay source of `key`.
    pub fn attach(&self, key: &str, source: Arc<dyn Replay>) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.entry(key.to_string()).or_default().source = Some(source);
    }

    pub fn detach(&self, key: &str) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = groups.get_mut(key) {
            g.source = None;
            if g.is_idle() {
                groups.remove(key);
            }
        }
    }

    /// Records `event` in the group's source and fans it out. Returns the number of
    /// subscribers it reached.
    pub fn publish(&self, key: &str, event: HubEvent) -> usize {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = groups.get_mut(key) else {
            return 0;
        };

        if let Some(source) = &group.source {
            source.record(&event);
        }

        group.subscribers.retain(|s| s.offer(key, event.clone()));
        let reached = group.subscribers.len();
        if group.is_idle() {
            groups.remove(key);
        }
        reached
    }

    /// Replays the group's history to `subscriber`, then registers it for live delivery.
    ///
    /// A replay longer than the free room in the channel is cut to its newest events.
    /// Joining a group twice with the same subscriber replays again but keeps a single
    /// registration.
    pub fn join(&self, key: &str, subscriber: &Subscriber) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups.entry(key.to_string()).or_default();
        group.subscribers.retain(|s| s.id != subscriber.id);

        if let Some(source) = &group.source {
            let history = source.replay();
            let skip = history.len().saturating_sub(subscriber.tx.capacity());
            for event in history.into_iter().skip(skip) {
                if !subscriber.offer(key, event) {
                    return;
                }
            }
        }

        if !subscriber.evicted.is_cancelled() && !subscriber.tx.is_closed() {
            group.subscribers.push(subscriber.clone());
        }
    }

    pub fn leave(&self, key: &str, subscriber: SubscriberId) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = groups.get_mut(key) {
            g.subscribers.retain(|s| s.id != subscriber);
            if g.is_idle() {
                groups.remove(key);
            }
        }
    }

    pub fn leave_all(&self, subscriber: SubscriberId) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        for g in groups.values_mut() {
            g.subscribers.retain(|s| s.id != subscriber);
        }
        groups.retain(|_, g| !g.is_idle());
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(key).map(|g| g.subscribers.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl Replay for Lines {
        fn record(&self, event: &HubEvent) {
            if let HubEvent::Log { line } = event {
                self.0.lock().unwrap().push(line.clone());
            }
        }

        fn replay(&self) -> Vec<HubEvent> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|line| HubEvent::Log { line: line.clone() })
                .collect()
        }
    }

    fn log(line: &str) -> HubEvent {
        HubEvent::Log {
            line: line.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Delivery>) -> Vec<HubEvent> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d.event);
        }
        out
    }

    #[test]
    fn join_replays_history_then_live_exactly_once() {
        let hub = Broadcaster::new();
        hub.attach("instance:1", Arc::new(Lines::default()));
        hub.publish("instance:1", log("a"));
        hub.publish("instance:1", log("b"));

        let (sub, mut rx) = hub.subscribe(16);
        hub.join("instance:1", &sub);
        hub.publish("instance:1", log("c"));

        assert_eq!(drain(&mut rx), vec![log("a"), log("b"), log("c")]);
    }

    #[test]
    fn fan_out_is_identical_for_every_subscriber() {
        let hub = Broadcaster::new();
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (sub, rx) = hub.subscribe(16);
            hub.join("g", &sub);
            rxs.push(rx);
        }
        assert_eq!(hub.publish("g", log("x")), 3);
        hub.publish("g", log("y"));
        for rx in rxs.iter_mut() {
            assert_eq!(drain(rx), vec![log("x"), log("y")]);
        }
    }

    #[test]
    fn leave_stops_delivery_and_closed_channels_are_pruned() {
        let hub = Broadcaster::new();
        let (s1, mut rx1) = hub.subscribe(16);
        let (s2, rx2) = hub.subscribe(16);
        hub.join("g", &s1);
        hub.join("g", &s2);

        drop(rx2);
        hub.leave("g", s1.id());
        assert_eq!(hub.publish("g", log("x")), 0);
        assert!(drain(&mut rx1).is_empty());
        assert_eq!(hub.subscriber_count("g"), 0);
        assert!(!s2.evicted().is_cancelled());
    }

    #[test]
    fn rejoin_keeps_single_registration() {
        let hub = Broadcaster::new();
        let (sub, mut rx) = hub.subscribe(16);
        hub.join("g", &sub);
        hub.join("g", &sub);
        hub.publish("g", log("x"));
        assert_eq!(drain(&mut rx), vec![log("x")]);
    }

    #[test]
    fn leave_all_drops_every_membership() {
        let hub = Broadcaster::new();
        let (sub, _rx) = hub.subscribe(16);
        hub.join("a", &sub);
        hub.join("b", &sub);
        hub.leave_all(sub.id());
        assert_eq!(hub.subscriber_count("a"), 0);
        assert_eq!(hub.subscriber_count("b"), 0);
    }

    #[test]
    fn a_subscriber_that_never_drains_is_evicted() {
        let hub = Broadcaster::new();
        let (stuck, _stuck_rx) = hub.subscribe(4);
        let (live, mut live_rx) = hub.subscribe(64);
        hub.join("g", &stuck);
        hub.join("other", &stuck);
        hub.join("g", &live);

        for i in 0..4 {
            assert_eq!(hub.publish("g", log(&i.to_string())), 2);
        }
        assert!(!stuck.evicted().is_cancelled());

        assert_eq!(hub.publish("g", log("overflow")), 1);
        assert!(stuck.evicted().is_cancelled());
        assert_eq!(hub.subscriber_count("g"), 1);
        assert_eq!(hub.publish("other", log("x")), 0);
        assert_eq!(hub.subscriber_count("other"), 0);

        assert_eq!(drain(&mut live_rx).len(), 5);
    }

    #[test]
    fn oversized_replay_keeps_the_newest_events() {
        let hub = Broadcaster::new();
        hub.attach("g", Arc::new(Lines::default()));
        for i in 0..10 {
            hub.publish("g", log(&i.to_string()));
        }

        let (sub, mut rx) = hub.subscribe(3);
        hub.join("g", &sub);
        assert!(!sub.evicted().is_cancelled());
        assert_eq!(drain(&mut rx), vec![log("7"), log("8"), log("9")]);
        assert_eq!(hub.publish("g", log("10")), 1);
    }

    #[test]
    fn concurrent_join_sees_gapless_sequence() {
        let hub = Arc::new(Broadcaster::new());
        hub.attach("g", Arc::new(Lines::default()));

        let publisher = {
            let hub = hub.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    hub.publish("g", log(&i.to_string()));
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(1));
        let (sub, mut rx) = hub.subscribe(4096);
        hub.join("g", &sub);
        publisher.join().unwrap();

        let got: Vec<u32> = drain(&mut rx)
            .into_iter()
            .map(|e| match e {
                HubEvent::Log { line } => line.parse().unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let expected: Vec<u32> = (0..2000).collect();
        assert_eq!(got, expected);
    }
}
