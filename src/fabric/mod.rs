//! Event and listener fabric.
//!
//! Tracks event state per node, fans status changes out to subscribers,
//! aggregates program builds and routes context errors to their listeners.
//! The fabric never touches a socket: outbound notifications go through a
//! [`NotificationSink`].

mod builds;
mod events;
mod listeners;
mod state;

use async_trait::async_trait;
use std::sync::Arc;

pub use builds::BuildAggregator;
pub use events::{EventSnapshot, EventTable};
pub use listeners::{BuildListener, BuildReport, ContextErrorDispatcher, ContextErrorListener};
pub use state::{EventState, EventStatus};

use crate::protocol::Notification;
use crate::registry::{ObjectState, RemoteObject, Teardown};
use crate::types::{status, FabricConfig, PeerId, Result};

/// Delivers a notification to one connected peer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, peer: PeerId, notification: Notification) -> Result<()>;
}

#[derive(Debug)]
pub struct Fabric {
    pub events: EventTable,
    pub context_errors: ContextErrorDispatcher,
    pub builds: BuildAggregator,
}

impl Fabric {
    pub fn new(sink: Arc<dyn NotificationSink>, config: &FabricConfig) -> Self {
        Self {
            events: EventTable::new(sink),
            context_errors: ContextErrorDispatcher::new(config.context_error_window),
            builds: BuildAggregator::new(),
        }
    }

    /// Apply a notification received from a peer.
    pub async fn apply(&self, notification: Notification) {
        match notification {
            Notification::EventStatusChanged { event, status } => {
                self.events.apply_remote(event, status).await;
            }
            Notification::ContextError {
                context,
                info,
                private_info,
            } => {
                self.context_errors.dispatch(context, &info, &private_info);
            }
            Notification::ProgramBuildComplete {
                program,
                device,
                status,
            } => {
                self.builds.report(program, device, status);
            }
        }
    }

    /// Forget everything tied to a closed connection.
    pub fn drop_peer(&self, peer: PeerId) {
        let lost_events = self.events.drop_peer(peer);
        let failed_builds = self.builds.fail_peer(peer, status::CONNECTION_LOST);
        tracing::debug!(%peer, lost_events, failed_builds, "peer dropped from fabric");
    }
}

impl Teardown for Fabric {
    fn teardown(&self, object: &RemoteObject) {
        match &object.state {
            ObjectState::Event { .. } => {
                self.events.remove(object.id);
            }
            ObjectState::Program { .. } => {
                self.builds.cancel(object.id);
            }
            ObjectState::Context { .. } => {
                self.context_errors.unregister(object.id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::types::ObjectId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fabric() -> Arc<Fabric> {
        let mut sink = MockNotificationSink::new();
        sink.expect_notify().returning(|_, _| Ok(()));
        Arc::new(Fabric::new(Arc::new(sink), &FabricConfig::default()))
    }

    #[tokio::test]
    async fn test_releasing_program_cancels_its_build() {
        let fabric = fabric();
        let registry = Registry::with_teardown(fabric.clone());
        let program = ObjectId::from_raw(50);
        registry
            .register(RemoteObject::proxy(
                program,
                ObjectState::Program { context: ObjectId::from_raw(1) },
                vec![],
            ))
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        fabric
            .builds
            .begin(
                program,
                vec![(ObjectId::from_raw(3), PeerId::new())],
                Arc::new(move |_: &BuildReport| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        registry.release(program);
        fabric
            .apply(Notification::ProgramBuildComplete {
                program,
                device: ObjectId::from_raw(3),
                status: 0,
            })
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_releasing_event_removes_it() {
        let fabric = fabric();
        let registry = Registry::with_teardown(fabric.clone());
        let event = ObjectId::from_raw(300);
        fabric.events.create_local(event, ObjectId::from_raw(1)).unwrap();
        registry
            .register(RemoteObject::backing(
                event,
                ObjectState::Event { context: ObjectId::from_raw(1), user: false },
                None,
            ))
            .unwrap();

        registry.release(event);
        assert!(!fabric.events.contains(event));
    }
}
