//! Reply deadline for the one outstanding scheduler request.
//!
//! At most one reference token is ever armed; arming a new one supersedes
//! the old timer outright. Each arm starts a fresh sleep task under a new
//! generation number, so a timer that fired while being superseded is
//! recognizably stale when its event reaches the loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::subsystem::SchedEvent;

pub(crate) struct ReplyWatch {
    timeout: Duration,
    events: mpsc::UnboundedSender<SchedEvent>,
    generation: u64,
    armed: Option<Armed>,
}

struct Armed {
    reference: String,
    timer: JoinHandle<()>,
}

impl ReplyWatch {
    pub(crate) fn new(timeout: Duration, events: mpsc::UnboundedSender<SchedEvent>) -> Self {
        Self {
            timeout,
            events,
            generation: 0,
            armed: None,
        }
    }

    /// (Re)start the deadline for `reference`, superseding any armed token.
    pub(crate) fn arm(&mut self, reference: String) {
        self.disarm("superseded by a new request");
        self.generation += 1;
        let generation = self.generation;
        let timeout = self.timeout;
        let events = self.events.clone();
        // The deadline is fixed here, at arm time, not when the spawned
        // task first polls.
        let sleep = tokio::time::sleep(timeout);
        let timer = tokio::spawn(async move {
            sleep.await;
            let _ = events.send(SchedEvent::ReplyTimeout { generation });
        });
        debug!(
            %reference,
            generation,
            timeout_ms = timeout.as_millis() as u64,
            "scheduler reply deadline armed"
        );
        self.armed = Some(Armed { reference, timer });
    }

    /// Stop the deadline and forget the token. Safe with nothing armed.
    pub(crate) fn disarm(&mut self, reason: &str) {
        if let Some(armed) = self.armed.take() {
            armed.timer.abort();
            trace!(reference = %armed.reference, reason, "scheduler reply deadline stopped");
        }
    }

    /// Whether `reference` answers the outstanding request.
    pub(crate) fn matches(&self, reference: &str) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| armed.reference == reference)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Consume the armed state for a firing timer. Yields the awaited
    /// reference only when `generation` is the live one; a timer that lost
    /// an arm/abort race is stale and yields nothing.
    pub(crate) fn expire(&mut self, generation: u64) -> Option<String> {
        if generation != self.generation {
            return None;
        }
        self.armed.take().map(|armed| {
            armed.timer.abort();
            armed.reference
        })
    }
}

impl Drop for ReplyWatch {
    fn drop(&mut self) {
        self.disarm("subsystem dropped");
    }
}
