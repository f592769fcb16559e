// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed pub-sub event bus with bounded history.
//!
//! Three behaviors: synchronous fan-out to registered sinks, append to a
//! bounded ring of retained events, and replay by since-timestamp cursor.
//! Streaming consumers subscribe through a broadcast channel; lagged
//! receivers count their losses but never block the publisher.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use forge_core::{Event, EventKind};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default number of events retained in history.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Default broadcast channel capacity.
const BROADCAST_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Subscription filter: by kind set, by task id, or wildcard.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<BTreeSet<EventKind>>,
    task_id: Option<String>,
}

impl EventFilter {
    /// Wildcard filter matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    #[must_use]
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            task_id: None,
        }
    }

    /// Restrict to one task.
    #[must_use]
    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            kinds: None,
            task_id: Some(task_id.into()),
        }
    }

    /// Additionally restrict an existing filter to one task.
    #[must_use]
    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Whether `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if event.task_id.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Bus internals
// ---------------------------------------------------------------------------

type SinkFn = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Sink {
    id: u64,
    filter: EventFilter,
    deliver: SinkFn,
}

struct BusInner {
    seq: u64,
    history: VecDeque<Event>,
    max_history: usize,
    evicted: u64,
    sinks: Vec<Sink>,
    next_sink_id: u64,
    total_published: u64,
    sink_failures: u64,
    shutdown: bool,
}

/// Snapshot of bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total number of events published.
    pub total_published: u64,
    /// Events currently retained in history.
    pub history_len: usize,
    /// Events evicted from history so far.
    pub evicted: u64,
    /// Registered sinks plus live broadcast receivers.
    pub subscriber_count: usize,
    /// Sinks removed after a delivery failure.
    pub sink_failures: u64,
    /// Events lost to lagging broadcast receivers.
    pub dropped: u64,
}

/// Result of a since-cursor replay.
#[derive(Debug, Clone)]
pub struct Replay {
    /// Retained events newer than the cursor, in publication order.
    pub events: Vec<Event>,
    /// `true` when the cursor pre-dates the oldest retained event and
    /// eviction has occurred — the caller has lost events.
    pub lost_history: bool,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// The shared event bus.
///
/// Publication assigns `evt_<n>_<unix_ms>` ids with `n` strictly increasing.
/// Sink fan-out happens under the bus lock — sinks must not publish
/// re-entrantly. A sink returning an error is removed; remaining sinks and
/// history are unaffected.
pub struct EventBus {
    inner: Mutex<BusInner>,
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus retaining [`DEFAULT_MAX_HISTORY`] events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Create a bus with an explicit history bound.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(BusInner {
                seq: 0,
                history: VecDeque::new(),
                max_history: max_history.max(1),
                evicted: 0,
                sinks: Vec::new(),
                next_sink_id: 0,
                total_published: 0,
                sink_failures: 0,
                shutdown: false,
            }),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event and return it.
    ///
    /// After [`shutdown`](Self::shutdown) the event is constructed but
    /// neither retained nor delivered.
    pub fn publish(
        &self,
        kind: EventKind,
        task_id: Option<&str>,
        data: serde_json::Value,
    ) -> Event {
        let mut inner = self.inner.lock().expect("bus lock poisoned");

        let now = Utc::now();
        inner.seq += 1;
        let event = Event {
            id: format!("evt_{}_{}", inner.seq, now.timestamp_millis()),
            kind,
            timestamp: now,
            task_id: task_id.map(str::to_string),
            data,
        };

        if inner.shutdown {
            warn!(target: "forge.bus", kind = %kind, "publish after shutdown dropped");
            return event;
        }

        inner.total_published += 1;
        inner.history.push_back(event.clone());
        // Evict the overflowing block in one pass.
        while inner.history.len() > inner.max_history {
            inner.history.pop_front();
            inner.evicted += 1;
        }

        // Fan out to sinks; failing sinks are removed, the rest still
        // receive the event.
        let mut failed: Vec<u64> = Vec::new();
        for sink in &inner.sinks {
            if sink.filter.matches(&event) {
                if let Err(e) = (sink.deliver)(&event) {
                    warn!(
                        target: "forge.bus",
                        sink = sink.id,
                        error = %e,
                        "sink failed; removing"
                    );
                    failed.push(sink.id);
                }
            }
        }
        if !failed.is_empty() {
            inner.sink_failures += failed.len() as u64;
            inner.sinks.retain(|s| !failed.contains(&s.id));
        }

        // Best-effort broadcast; no receivers is fine.
        let _ = self.tx.send(event.clone());

        debug!(target: "forge.bus", id = %event.id, kind = %kind, "published");
        event
    }

    /// Register a delivery sink with a filter. Returns the sink id.
    pub fn subscribe_sink(
        &self,
        filter: EventFilter,
        deliver: impl Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.next_sink_id += 1;
        let id = inner.next_sink_id;
        inner.sinks.push(Sink {
            id,
            filter,
            deliver: Box::new(deliver),
        });
        id
    }

    /// Remove a sink registered with [`subscribe_sink`](Self::subscribe_sink).
    pub fn unsubscribe(&self, sink_id: u64) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.sinks.retain(|s| s.id != sink_id);
    }

    /// Create a streaming subscription receiving future events that pass
    /// `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter,
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Replay retained events newer than `since` (all retained history when
    /// `None`), optionally restricted to one task.
    #[must_use]
    pub fn events_since(&self, since: Option<DateTime<Utc>>, task_id: Option<&str>) -> Replay {
        let inner = self.inner.lock().expect("bus lock poisoned");
        let lost_history = match since {
            None => inner.evicted > 0,
            Some(cursor) => {
                inner.evicted > 0
                    && inner
                        .history
                        .front()
                        .is_some_and(|oldest| cursor < oldest.timestamp)
            }
        };
        let events = inner
            .history
            .iter()
            .filter(|e| since.is_none_or(|cursor| e.timestamp > cursor))
            .filter(|e| task_id.is_none() || e.task_id.as_deref() == task_id)
            .cloned()
            .collect();
        Replay {
            events,
            lost_history,
        }
    }

    /// Snapshot of bus statistics.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        let inner = self.inner.lock().expect("bus lock poisoned");
        EventBusStats {
            total_published: inner.total_published,
            history_len: inner.history.len(),
            evicted: inner.evicted,
            subscriber_count: inner.sinks.len() + self.tx.receiver_count(),
            sink_failures: inner.sink_failures,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Drain subscribers and stop accepting events.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.shutdown = true;
        inner.sinks.clear();
        debug!(target: "forge.bus", "bus shut down");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("EventBus")
            .field("total_published", &stats.total_published)
            .field("history_len", &stats.history_len)
            .field("subscriber_count", &stats.subscriber_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventSubscription
// ---------------------------------------------------------------------------

/// A streaming handle over future bus events.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
}

impl EventSubscription {
    /// Wait for the next event that passes this subscription's filter.
    ///
    /// Resolves to `None` once the bus is gone. When the subscriber falls
    /// behind, the skipped events are counted in
    /// [`EventBusStats::dropped`] and reception continues from the newest
    /// available event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if self.filter.matches(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Poll for a matching event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if self.filter.matches(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ids_are_monotonic_and_well_formed() {
        let bus = EventBus::new();
        let a = bus.publish(EventKind::TaskStart, Some("t1"), json!({}));
        let b = bus.publish(EventKind::TaskProgress, Some("t1"), json!({}));
        assert!(a.id.starts_with("evt_1_"));
        assert!(b.id.starts_with("evt_2_"));
        assert!(a.sequence().unwrap() < b.sequence().unwrap());
        assert!(a.timestamp <= b.timestamp);
    }

    #[test]
    fn ring_evicts_oldest_block() {
        let bus = EventBus::with_max_history(3);
        for i in 0..5 {
            bus.publish(EventKind::Log, None, json!({ "i": i }));
        }
        let stats = bus.stats();
        assert_eq!(stats.history_len, 3);
        assert_eq!(stats.evicted, 2);
        let replay = bus.events_since(None, None);
        assert_eq!(replay.events.len(), 3);
        assert_eq!(replay.events[0].data["i"], 2);
        assert!(replay.lost_history);
    }

    #[test]
    fn sink_receives_matching_events_only() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        bus.subscribe_sink(EventFilter::kinds([EventKind::TaskComplete]), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(EventKind::TaskStart, None, json!({}));
        bus.publish(EventKind::TaskComplete, None, json!({}));
        bus.publish(EventKind::Log, None, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_sink_is_removed_others_keep_receiving() {
        let bus = EventBus::new();
        let good = Arc::new(AtomicU32::new(0));
        let g = Arc::clone(&good);
        bus.subscribe_sink(EventFilter::all(), move |_| {
            g.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe_sink(EventFilter::all(), |_| anyhow::bail!("sink exploded"));

        bus.publish(EventKind::Log, None, json!({}));
        bus.publish(EventKind::Log, None, json!({}));

        assert_eq!(good.load(Ordering::SeqCst), 2);
        let stats = bus.stats();
        assert_eq!(stats.sink_failures, 1);
        // History unaffected by the sink failure.
        assert_eq!(stats.history_len, 2);
    }

    #[test]
    fn task_filter_scopes_events() {
        let bus = EventBus::new();
        bus.publish(EventKind::TaskStart, Some("t1"), json!({}));
        bus.publish(EventKind::TaskStart, Some("t2"), json!({}));
        let replay = bus.events_since(None, Some("t2"));
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].task_id.as_deref(), Some("t2"));
    }

    #[test]
    fn since_cursor_replays_newer_events() {
        let bus = EventBus::new();
        let first = bus.publish(EventKind::Log, None, json!({"n": 1}));
        std::thread::sleep(std::time::Duration::from_millis(5));
        bus.publish(EventKind::Log, None, json!({"n": 2}));
        let replay = bus.events_since(Some(first.timestamp), None);
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].data["n"], 2);
        assert!(!replay.lost_history);
    }

    #[test]
    fn stale_cursor_reports_lost_history() {
        let bus = EventBus::with_max_history(2);
        let first = bus.publish(EventKind::Log, None, json!({}));
        std::thread::sleep(std::time::Duration::from_millis(5));
        for _ in 0..4 {
            bus.publish(EventKind::Log, None, json!({}));
        }
        let replay = bus.events_since(Some(first.timestamp - chrono::Duration::seconds(1)), None);
        assert!(replay.lost_history);
    }

    #[tokio::test]
    async fn broadcast_subscription_receives_future_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::task("t9"));
        bus.publish(EventKind::TaskStart, Some("t9"), json!({}));
        bus.publish(EventKind::TaskStart, Some("other"), json!({}));
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.task_id.as_deref(), Some("t9"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn shutdown_drains_sinks_and_stops_recording() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        bus.subscribe_sink(EventFilter::all(), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(EventKind::Log, None, json!({}));
        bus.shutdown();
        bus.publish(EventKind::Log, None, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().total_published, 1);
    }

    #[test]
    fn unsubscribe_removes_sink() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        let id = bus.subscribe_sink(EventFilter::all(), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(EventKind::Log, None, json!({}));
        bus.unsubscribe(id);
        bus.publish(EventKind::Log, None, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
