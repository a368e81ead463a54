//! Run events for observers.
//!
//! Controllers emit [`BookEvent`]s on a [`tokio::sync::broadcast`] channel so
//! that a UI or logger can follow a run without touching controller state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BookEvent {
    RunStarted {
        book_id: String,
        run_id: String,
        mode: String,
    },
    SessionResumed {
        book_id: String,
        last_completed_chapter: u32,
        last_completed_page: u32,
    },
    OutlineReady {
        book_id: String,
    },
    CoverGenerated {
        book_id: String,
        url: String,
    },
    UnitStarted {
        chapter: u32,
        page: u32,
    },
    UnitCompleted {
        chapter: u32,
        page: u32,
        new_characters: usize,
        new_plot_points: usize,
    },
    CheckpointSaved {
        book_id: String,
        chapter: u32,
        page: u32,
    },
    ChapterCompleted {
        chapter: u32,
    },
    BatchSubmitted {
        job_id: String,
        tasks: usize,
    },
    BatchPolled {
        job_id: String,
        attempt: usize,
        status: String,
    },
    RunCompleted {
        book_id: String,
        units: usize,
        duration_ms: u64,
    },
    RunCancelled {
        book_id: String,
        chapter: u32,
        page: u32,
    },
    RunFailed {
        book_id: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<BookEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: BookEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BookEvent> {
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

        emitter.emit(BookEvent::UnitStarted { chapter: 2, page: 1 });

        assert_eq!(
            rx.recv().await.unwrap(),
            BookEvent::UnitStarted { chapter: 2, page: 1 }
        );
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(BookEvent::RunFailed {
            book_id: "b".into(),
            error: "boom".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(BookEvent::ChapterCompleted { chapter: 3 }).unwrap();
        assert_eq!(json["event"], "chapter_completed");
        assert_eq!(json["chapter"], 3);
    }
}
