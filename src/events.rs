// Session events: loading signals, refresh progress and logout notices
//
// Observers (progress indicators, redirect-to-login handlers) subscribe to a
// broadcast channel; the client never calls into presentation code directly.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metrics::SessionMetrics;
use std::sync::Arc;

/// Events buffered per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// logout() was called
    UserRequested,
    /// the shared token refresh failed
    RefreshFailed,
    /// the profile bootstrap ended in a terminal 401
    ProfileUnauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A dispatch (original, refresh or retry) is about to be sent
    LoadingStarted { request_id: Uuid },
    /// That dispatch settled; emitted exactly once per LoadingStarted
    LoadingFinished { request_id: Uuid },
    /// A refresh call was issued
    RefreshStarted,
    /// A refreshed token was committed
    TokenRefreshed,
    /// The session was cleared; observers should redirect to login
    LoggedOut { reason: LogoutReason },
}

/// Event fan-out shared by every component of one client
#[derive(Clone)]
pub struct SessionEvents {
    sender: broadcast::Sender<SessionEvent>,
    metrics: Arc<SessionMetrics>,
}

impl SessionEvents {
    pub fn new(metrics: Arc<SessionMetrics>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender, metrics }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(?event, "Session event");
        let _ = self.sender.send(event);
    }

    /// Emit LoadingStarted now and LoadingFinished when the guard drops
    pub fn begin_loading(&self) -> LoadingGuard {
        let request_id = Uuid::new_v4();
        self.metrics.record_dispatch_started();
        self.emit(SessionEvent::LoadingStarted { request_id });
        LoadingGuard {
            events: self.clone(),
            request_id,
        }
    }
}

/// Pairs every LoadingStarted with exactly one LoadingFinished, including
/// when the dispatch future is dropped mid-flight.
pub struct LoadingGuard {
    events: SessionEvents,
    request_id: Uuid,
}

impl LoadingGuard {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.events.metrics.record_dispatch_finished();
        self.events.emit(SessionEvent::LoadingFinished {
            request_id: self.request_id,
        });
    }
}

/// Drain everything currently buffered in a receiver
pub fn drain(receiver: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event receiver lagged");
            }
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> SessionEvents {
        SessionEvents::new(Arc::new(SessionMetrics::new()))
    }

    #[test]
    fn test_guard_pairs_loading_events() {
        let events = events();
        let mut rx = events.subscribe();

        let guard = events.begin_loading();
        let id = guard.request_id();
        assert_eq!(events.metrics().in_flight(), 1);
        drop(guard);

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::LoadingStarted { request_id: id },
                SessionEvent::LoadingFinished { request_id: id },
            ]
        );
        assert_eq!(events.metrics().in_flight(), 0);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = events();
        events.emit(SessionEvent::RefreshStarted);
        let _guard = events.begin_loading();
    }

    #[tokio::test]
    async fn test_guard_finishes_when_future_is_cancelled() {
        let events = events();
        let mut rx = events.subscribe();

        let pending = {
            let events = events.clone();
            async move {
                let _guard = events.begin_loading();
                std::future::pending::<()>().await;
            }
        };
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;

        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], SessionEvent::LoadingStarted { .. }));
        assert!(matches!(seen[1], SessionEvent::LoadingFinished { .. }));
    }
}
