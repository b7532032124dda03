//! Correlation of auxiliary requests with their host responses.
//!
//! Each outstanding request parks a oneshot sender keyed by its
//! [`RequestId`]. The connection dispatcher resolves entries as responses
//! arrive; timeouts, session teardown, and connection loss settle the rest.
//! An entry is removed before its sender fires, so every request settles
//! exactly once.

use crate::error::EngineError;
use log::{debug, warn};
use meterlink_protocol::{HostMessage, RequestId, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// Request families tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    UploadVectors,
    SearchVectors,
    SearchWeb,
}

impl PendingKind {
    fn as_str(self) -> &'static str {
        match self {
            PendingKind::UploadVectors => "upload_vectors",
            PendingKind::SearchVectors => "search_vectors",
            PendingKind::SearchWeb => "search_web",
        }
    }
}

/// Why a session's outstanding requests are being failed in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailReason {
    SessionEnded,
    ConnectionClosed,
}

type Settlement = Result<HostMessage, EngineError>;

struct PendingEntry {
    session_id: SessionId,
    kind: PendingKind,
    sender: oneshot::Sender<Settlement>,
}

/// Receiving half handed back by [`PendingRegistry::register`].
pub(crate) struct PendingTicket {
    request_id: RequestId,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingTicket {
    pub(crate) fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park a request. The entry must exist before the request is sent.
    pub(crate) fn register(
        &self,
        session_id: SessionId,
        kind: PendingKind,
        request_id: RequestId,
    ) -> PendingTicket {
        let (sender, receiver) = oneshot::channel();
        debug!(
            "pending request registered (session_id={}, request_id={}, kind={})",
            session_id,
            request_id,
            kind.as_str()
        );
        self.entries.lock().insert(
            request_id.clone(),
            PendingEntry {
                session_id,
                kind,
                sender,
            },
        );
        PendingTicket {
            request_id,
            receiver,
        }
    }

    /// Wait for the response or fail with `RequestTimeout` after `timeout`.
    pub(crate) async fn wait(
        &self,
        ticket: PendingTicket,
        timeout: Duration,
    ) -> Result<HostMessage, EngineError> {
        let PendingTicket {
            request_id,
            receiver,
        } = ticket;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(EngineError::RequestCancelled(request_id)),
            Err(_) => {
                self.entries.lock().remove(&request_id);
                warn!(
                    "pending request timed out (request_id={}, after_ms={})",
                    request_id,
                    timeout.as_millis()
                );
                Err(EngineError::RequestTimeout {
                    request_id,
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Deliver a response. Returns false when nothing was waiting.
    pub(crate) fn resolve(&self, request_id: &RequestId, message: HostMessage) -> bool {
        self.settle(request_id, Ok(message))
    }

    /// Fail one request with the given error.
    pub(crate) fn reject(&self, request_id: &RequestId, error: EngineError) -> bool {
        self.settle(request_id, Err(error))
    }

    /// Cancel one request on the caller's behalf.
    pub(crate) fn cancel(&self, request_id: &RequestId) -> bool {
        self.settle(
            request_id,
            Err(EngineError::RequestCancelled(request_id.clone())),
        )
    }

    /// Fail every request belonging to `session_id`.
    pub(crate) fn fail_session(&self, session_id: SessionId, reason: FailReason) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = drained.len();
        for (request_id, entry) in drained {
            debug!(
                "pending request failed (session_id={}, request_id={}, kind={}, reason={:?})",
                session_id,
                request_id,
                entry.kind.as_str(),
                reason
            );
            let error = match reason {
                FailReason::SessionEnded => EngineError::SessionEnded(session_id),
                FailReason::ConnectionClosed => {
                    EngineError::Transport("connection closed before response".to_string())
                }
            };
            let _ = entry.sender.send(Err(error));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn settle(&self, request_id: &RequestId, settlement: Settlement) -> bool {
        let Some(entry) = self.entries.lock().remove(request_id) else {
            debug!("no pending request for response (request_id={})", request_id);
            return false;
        };
        let _ = entry.sender.send(settlement);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn web_response(id: &str) -> HostMessage {
        HostMessage::SearchWebResponse {
            request_id: RequestId::from(id),
            results: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry.register(SessionId(1), PendingKind::SearchWeb, RequestId::from("a"));

        assert!(registry.resolve(&RequestId::from("a"), web_response("a")));
        assert!(!registry.resolve(&RequestId::from("a"), web_response("a")));

        let message = registry
            .wait(ticket, Duration::from_secs(1))
            .await
            .expect("resolved");
        assert_eq!(message, web_response("a"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let registry = PendingRegistry::new();
        let ticket = registry.register(
            SessionId(1),
            PendingKind::SearchVectors,
            RequestId::from("slow"),
        );
        let err = registry
            .wait(ticket, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RequestTimeout { after_ms: 500, .. }
        ));
        assert_eq!(registry.len(), 0);
        assert!(!registry.resolve(&RequestId::from("slow"), web_response("slow")));
    }

    #[tokio::test]
    async fn failing_a_session_leaves_other_sessions_alone() {
        let registry = PendingRegistry::new();
        let first = registry.register(SessionId(1), PendingKind::UploadVectors, RequestId::from("x"));
        let _other = registry.register(SessionId(2), PendingKind::UploadVectors, RequestId::from("y"));

        assert_eq!(registry.fail_session(SessionId(1), FailReason::SessionEnded), 1);
        let err = registry
            .wait(first, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionEnded(SessionId(1))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn cancel_and_connection_loss_surface_distinct_errors() {
        let registry = PendingRegistry::new();
        let cancelled = registry.register(SessionId(3), PendingKind::SearchWeb, RequestId::from("c"));
        assert!(registry.cancel(cancelled.request_id()));
        assert!(matches!(
            registry.wait(cancelled, Duration::from_secs(1)).await,
            Err(EngineError::RequestCancelled(_))
        ));

        let dropped = registry.register(SessionId(3), PendingKind::SearchWeb, RequestId::from("d"));
        registry.fail_session(SessionId(3), FailReason::ConnectionClosed);
        assert!(matches!(
            registry.wait(dropped, Duration::from_secs(1)).await,
            Err(EngineError::Transport(_))
        ));
    }
}
