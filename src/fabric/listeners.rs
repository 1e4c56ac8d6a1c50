//! Listener traits and context-error dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::ObjectId;

/// Receives asynchronous errors raised against a context.
pub trait ContextErrorListener: Send + Sync {
    fn on_error(&self, context: ObjectId, info: &str, private_info: &[u8]);
}

impl<F> ContextErrorListener for F
where
    F: Fn(ObjectId, &str, &[u8]) + Send + Sync,
{
    fn on_error(&self, context: ObjectId, info: &str, private_info: &[u8]) {
        self(context, info, private_info)
    }
}

/// Outcome of a program build across every requested device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub program: ObjectId,
    /// `(device, status)` in the order the devices were requested.
    pub results: Vec<(ObjectId, i32)>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, status)| *status == 0)
    }

    /// First non-zero status, if any.
    pub fn first_failure(&self) -> Option<i32> {
        self.results
            .iter()
            .map(|(_, status)| *status)
            .find(|status| *status != 0)
    }
}

/// Receives the aggregated result of one build. Called exactly once.
pub trait BuildListener: Send + Sync {
    fn on_complete(&self, report: &BuildReport);
}

impl<F> BuildListener for F
where
    F: Fn(&BuildReport) + Send + Sync,
{
    fn on_complete(&self, report: &BuildReport) {
        self(report)
    }
}

/// Routes `ContextError` notifications to the listener registered for the
/// context, coalescing identical reports from several nodes.
pub struct ContextErrorDispatcher {
    window: Duration,
    listeners: Mutex<HashMap<ObjectId, Arc<dyn ContextErrorListener>>>,
    recent: Mutex<HashMap<(ObjectId, String), Instant>>,
}

impl std::fmt::Debug for ContextErrorDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextErrorDispatcher")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl ContextErrorDispatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            listeners: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, context: ObjectId, listener: Arc<dyn ContextErrorListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context, listener);
    }

    pub fn unregister(&self, context: ObjectId) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(ctx, _), _| *ctx != context);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&context)
            .is_some()
    }

    /// Deliver one report. Returns whether the listener was invoked.
    pub fn dispatch(&self, context: ObjectId, info: &str, private_info: &[u8]) -> bool {
        let listener = match self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&context)
        {
            Some(listener) => listener.clone(),
            None => {
                tracing::debug!(%context, "context error without listener dropped: {}", info);
                return false;
            }
        };

        let now = Instant::now();
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            recent.retain(|_, seen| now.duration_since(*seen) < self.window);
            let key = (context, info.to_string());
            if recent.contains_key(&key) {
                tracing::debug!(%context, "duplicate context error coalesced: {}", info);
                return false;
            }
            recent.insert(key, now);
        }

        tracing::info!(%context, "context error: {}", info);
        listener.on_error(context, info, private_info);
        true
    }
}
