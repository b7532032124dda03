use meterlink_protocol::{EventMsg, EventPayload, EventSink};
use parking_lot::Mutex;

/// Sink keeping every event for assertions.
#[derive(Default)]
pub(crate) struct CollectingSink {
    events: Mutex<Vec<EventMsg>>,
}

impl CollectingSink {
    pub(crate) fn payloads(&self) -> Vec<EventPayload> {
        self.events
            .lock()
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: EventMsg) {
        self.events.lock().push(event);
    }
}
