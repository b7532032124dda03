use meterlink_protocol::{EventMsg, EventPayload, EventSink, SessionStatus};
use parking_lot::Mutex;

/// Event sink keeping every event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventMsg>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventMsg> {
        self.events.lock().clone()
    }

    pub fn payloads(&self) -> Vec<EventPayload> {
        self.events
            .lock()
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }

    /// `(from, to)` of every status change, in order.
    pub fn status_changes(&self) -> Vec<(SessionStatus, SessionStatus)> {
        self.payloads()
            .into_iter()
            .filter_map(|payload| match payload {
                EventPayload::StatusChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Streamed text deltas, in order.
    pub fn deltas(&self) -> Vec<String> {
        self.payloads()
            .into_iter()
            .filter_map(|payload| match payload {
                EventPayload::TokenDelta { delta, .. } => Some(delta),
                _ => None,
            })
            .collect()
    }

    /// Utilization of every context warning.
    pub fn warnings(&self) -> Vec<f64> {
        self.payloads()
            .into_iter()
            .filter_map(|payload| match payload {
                EventPayload::ContextWarning { utilization, .. } => Some(utilization),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EventMsg) {
        self.events.lock().push(event);
    }
}
