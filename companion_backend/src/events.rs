//! Engine activity feed for the dashboard.

use crate::error::CompletionFailure;
use crate::scheduler::{CycleReport, ReengagementJob};
use crate::session::Mood;

#[derive(Debug, Clone)]
pub enum BotEvent {
    MessageReceived {
        user_id: i64,
        mood: Mood,
    },
    ReplySent {
        user_id: i64,
    },
    FarewellSent {
        user_id: i64,
    },
    CompletionFailed {
        user_id: i64,
        reason: CompletionFailure,
        active_credential: usize,
    },
    AccessDenied {
        user_id: i64,
    },
    AccessGranted {
        user_id: i64,
    },
    NotificationDispatched {
        user_id: i64,
        job: ReengagementJob,
    },
    NotificationFailed {
        user_id: i64,
        job: ReengagementJob,
        error: String,
    },
    CycleCompleted(CycleReport),
    OperatorMessage {
        user_id: i64,
        content: String,
        delivered: bool,
    },
}

/// Cheap cloneable handle for publishing [`BotEvent`]s.
///
/// Publishing never blocks and never fails; with no listener the event is
/// dropped.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<flume::Sender<BotEvent>>,
}

impl EventSink {
    pub fn new(tx: flume::Sender<BotEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: BotEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

pub fn channel() -> (EventSink, flume::Receiver<BotEvent>) {
    let (tx, rx) = flume::unbounded();
    (EventSink::new(tx), rx)
}
