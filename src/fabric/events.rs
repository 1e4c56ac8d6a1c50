//! Event table: per-node view of every event this node owns or observes.
//!
//! The owner drives transitions with [`EventTable::advance`]; observers apply
//! `EventStatusChanged` notifications with [`EventTable::apply_remote`]. Each
//! entry publishes its snapshot through a `watch` channel so waiters wake on
//! every change without polling.

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

use super::state::{EventState, EventStatus};
use super::NotificationSink;
use crate::protocol::Notification;
use crate::types::{Error, ObjectId, ObjectKind, PeerId, Result};

/// What waiters observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSnapshot {
    pub status: EventStatus,
    /// The peer owning this event disconnected before it finished.
    pub lost: bool,
}

struct EventEntry {
    context: ObjectId,
    /// Connection whose updates drive this event. `None` when owned locally.
    source: Option<PeerId>,
    tx: watch::Sender<EventSnapshot>,
    subscribers: Mutex<HashSet<PeerId>>,
    /// Serializes transitions and their fan-out so every subscriber sees the
    /// states in order.
    order: tokio::sync::Mutex<()>,
}

impl EventEntry {
    fn new(context: ObjectId, source: Option<PeerId>) -> Self {
        let (tx, _) = watch::channel(EventSnapshot {
            status: EventStatus::queued(),
            lost: false,
        });
        Self {
            context,
            source,
            tx,
            subscribers: Mutex::new(HashSet::new()),
            order: tokio::sync::Mutex::new(()),
        }
    }

    fn status(&self) -> EventStatus {
        self.tx.borrow().status
    }

    fn subscribers(&self) -> Vec<PeerId> {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn unsubscribe(&self, peer: PeerId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer)
    }
}

pub struct EventTable {
    events: RwLock<HashMap<ObjectId, Arc<EventEntry>>>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for EventTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTable")
            .field("events", &self.len())
            .finish()
    }
}

impl EventTable {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            sink,
        }
    }

    fn entry(&self, event: ObjectId) -> Result<Arc<EventEntry>> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .cloned()
            .ok_or_else(|| Error::invalid_object(event, ObjectKind::Event))
    }

    fn insert(&self, event: ObjectId, entry: EventEntry) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        if events.contains_key(&event) {
            return Err(Error::Duplicate(event));
        }
        events.insert(event, Arc::new(entry));
        Ok(())
    }

    /// Start tracking an event owned by this node, in QUEUED.
    pub fn create_local(&self, event: ObjectId, context: ObjectId) -> Result<()> {
        self.insert(event, EventEntry::new(context, None))
    }

    /// Start tracking an event owned by the node behind `source`.
    pub fn track_remote(&self, event: ObjectId, context: ObjectId, source: PeerId) -> Result<()> {
        self.insert(event, EventEntry::new(context, Some(source)))
    }

    pub fn contains(&self, event: ObjectId) -> bool {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&event)
    }

    pub fn context_of(&self, event: ObjectId) -> Option<ObjectId> {
        self.entry(event).ok().map(|entry| entry.context)
    }

    pub fn status(&self, event: ObjectId) -> Option<EventStatus> {
        self.entry(event).ok().map(|entry| entry.status())
    }

    /// Drive a locally owned event to `state`.
    ///
    /// Intermediate states on the success path are published too, so
    /// QUEUED → COMPLETE is observed as QUEUED → SUBMITTED → RUNNING →
    /// COMPLETE. Every subscriber is notified of every step in order.
    pub async fn advance(
        &self,
        event: ObjectId,
        state: EventState,
        exit_code: i32,
    ) -> Result<EventStatus> {
        let entry = self.entry(event)?;
        if entry.source.is_some() {
            return Err(Error::state_transition(format!(
                "{} is owned by another node",
                event
            )));
        }
        if !state.admits_exit_code(exit_code) {
            return Err(Error::validation(format!(
                "{}: exit code {} does not fit {}",
                event, exit_code, state
            )));
        }
        let _order = entry.order.lock().await;

        let mut current = entry.status();
        if !current.state.is_superseded_by(state) {
            return Err(Error::state_transition(format!(
                "{}: {} -> {}",
                event, current.state, state
            )));
        }
        while current.state != state {
            let step = if current.state.can_transition_to(state) {
                state
            } else {
                match current.state.next() {
                    Some(step) => step,
                    None => break,
                }
            };
            let code = if step == state { exit_code } else { 0 };
            current = EventStatus::new(step, code);
            entry.tx.send_modify(|snapshot| snapshot.status = current);
            tracing::debug!(%event, state = %step, exit_code = code, "event advanced");
            self.fan_out(event, &entry, current).await;
        }
        Ok(current)
    }

    /// Apply an `EventStatusChanged` received from a peer.
    ///
    /// Redundant and regressive updates are discarded. An exit code that does
    /// not fit the state is corrected before the update is stored. Returns
    /// whether the update was applied; applied updates are relayed to this
    /// node's own subscribers.
    pub async fn apply_remote(&self, event: ObjectId, status: EventStatus) -> bool {
        let status = if status.is_well_formed() {
            status
        } else {
            let fixed = status.normalized();
            tracing::warn!(
                %event,
                state = %status.state,
                exit_code = status.exit_code,
                corrected = fixed.exit_code,
                "malformed event status corrected"
            );
            fixed
        };
        let entry = match self.entry(event) {
            Ok(entry) => entry,
            Err(_) => {
                tracing::debug!(%event, state = %status.state, "status update for unknown event dropped");
                return false;
            }
        };
        let _order = entry.order.lock().await;

        let mut previous = entry.status().state;
        let applied = entry.tx.send_if_modified(|snapshot| {
            previous = snapshot.status.state;
            if previous.is_superseded_by(status.state) {
                snapshot.status = status;
                true
            } else {
                false
            }
        });
        if !applied {
            if previous.is_terminal() {
                tracing::warn!(%event, current = %previous, update = %status.state, "update to terminal event dropped");
            } else {
                tracing::debug!(%event, current = %previous, update = %status.state, "stale event update dropped");
            }
            return false;
        }
        tracing::debug!(%event, from = %previous, to = %status.state, "remote event update applied");
        self.fan_out(event, &entry, status).await;
        true
    }

    async fn fan_out(&self, event: ObjectId, entry: &EventEntry, status: EventStatus) {
        for peer in entry.subscribers() {
            let notification = Notification::EventStatusChanged { event, status };
            if let Err(e) = self.sink.notify(peer, notification).await {
                // A subscriber that cannot be reached is removed silently.
                entry.unsubscribe(peer);
                tracing::debug!(%event, %peer, "subscriber removed: {}", e);
            }
        }
    }

    /// Subscribe `peer` to future changes and return the current status.
    pub fn subscribe(&self, event: ObjectId, peer: PeerId) -> Result<EventStatus> {
        let entry = self.entry(event)?;
        entry
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer);
        Ok(entry.status())
    }

    /// Subscribe `peer` and push the current status if the event already
    /// left QUEUED.
    pub async fn attach_subscriber(&self, event: ObjectId, peer: PeerId) -> Result<()> {
        let entry = self.entry(event)?;
        let _order = entry.order.lock().await;
        entry
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer);
        let status = entry.status();
        if status.state != EventState::Queued {
            let notification = Notification::EventStatusChanged { event, status };
            if let Err(e) = self.sink.notify(peer, notification).await {
                entry.unsubscribe(peer);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&self, event: ObjectId, peer: PeerId) -> bool {
        self.entry(event)
            .map(|entry| entry.unsubscribe(peer))
            .unwrap_or(false)
    }

    /// Wait until `event` is terminal.
    ///
    /// Returns the terminal status (ERROR included). Fails with
    /// `ConnectionLost` when the owning peer disconnects first and with
    /// `InvalidObject` when the event is released while waiting.
    pub async fn wait(&self, event: ObjectId) -> Result<EventStatus> {
        let mut rx = self.entry(event)?.tx.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.lost || snapshot.status.state.is_terminal())
            .await
            .map(|snapshot| *snapshot)
            .map_err(|_| Error::invalid_object(event, ObjectKind::Event))?;
        if snapshot.lost && !snapshot.status.state.is_terminal() {
            return Err(Error::connection_lost(format!(
                "owner of {} disconnected",
                event
            )));
        }
        Ok(snapshot.status)
    }

    /// Wait for every event in `events`; fails on the first failure.
    pub async fn wait_all(&self, events: &[ObjectId]) -> Result<Vec<EventStatus>> {
        try_join_all(events.iter().map(|event| self.wait(*event))).await
    }

    /// A connection closed: drop its subscriptions and fail waiters on events
    /// it was driving.
    pub fn drop_peer(&self, peer: PeerId) -> usize {
        let entries: Vec<(ObjectId, Arc<EventEntry>)> = self
            .events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut lost = 0;
        for (event, entry) in entries {
            entry.unsubscribe(peer);
            if entry.source == Some(peer) {
                let marked = entry.tx.send_if_modified(|snapshot| {
                    if snapshot.status.state.is_terminal() || snapshot.lost {
                        false
                    } else {
                        snapshot.lost = true;
                        true
                    }
                });
                if marked {
                    tracing::warn!(%event, %peer, "event owner disconnected before completion");
                    lost += 1;
                }
            }
        }
        lost
    }

    /// Stop tracking `event`. Pending waiters fail with `InvalidObject`.
    pub fn remove(&self, event: ObjectId) -> bool {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
