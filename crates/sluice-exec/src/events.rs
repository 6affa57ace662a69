//! Engine event system for observability.
//!
//! Emits [`EngineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, progress reporters, UI, etc.) can subscribe
//! to execution progress without coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted while an executioner is running tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    ExecutionerStarted {
        backend: String,
    },
    ExecutionerStopped {
        backend: String,
        finished: usize,
        failed: usize,
    },
    TaskQueued {
        task_id: String,
    },
    TaskStarted {
        task_id: String,
        host: Option<String>,
        pid: Option<u32>,
    },
    TaskFinished {
        task_id: String,
        state: String,
        exit_code: i32,
    },
    TaskStartFailed {
        task_id: String,
        error: String,
    },
    TaskKilled {
        task_id: String,
    },
    /// A queued task that will never run: its dependency chain failed or its
    /// resource request exceeds every host in the cluster.
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    KillRequested,
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::TaskQueued {
            task_id: "t1".into(),
        });

        let event = rx.recv().await.unwrap();
        match event {
            EngineEvent::TaskQueued { task_id } => assert_eq!(task_id, "t1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(EngineEvent::KillRequested);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        let json1 = serde_json::to_string(&e1).unwrap();
        let json2 = serde_json::to_string(&e2).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(EngineEvent::TaskStartFailed {
            task_id: "t9".into(),
            error: "no such file".into(),
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = EngineEvent::TaskFinished {
            task_id: "task_42".into(),
            state: "FINISHED".into(),
            exit_code: 0,
        };

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: EngineEvent = serde_json::from_str(&json).unwrap();

        match deserialized {
            EngineEvent::TaskFinished {
                task_id,
                state,
                exit_code,
            } => {
                assert_eq!(task_id, "task_42");
                assert_eq!(state, "FINISHED");
                assert_eq!(exit_code, 0);
            }
            other => panic!("unexpected variant after round-trip: {:?}", other),
        }
    }
}
