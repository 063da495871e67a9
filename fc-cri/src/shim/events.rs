//! Advisory task events.
//!
//! Events are buffered in a bounded queue (capacity 128); when the embedding
//! publisher cannot keep up, the oldest event is dropped with a warning -
//! events are advisory, task state is authoritative.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fc_cri_shared::FcResult;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Queue capacity before oldest-event drop kicks in.
pub const EVENT_BUFFER: usize = 128;

/// Task lifecycle events published to containerd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Created { task_id: String, pid: u32 },
    Started { task_id: String, pid: u32 },
    Exited { task_id: String, exit_status: u32 },
    Deleted { task_id: String },
}

impl TaskEvent {
    /// Containerd topic the event belongs on.
    pub fn topic(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "/tasks/create",
            TaskEvent::Started { .. } => "/tasks/start",
            TaskEvent::Exited { .. } => "/tasks/exit",
            TaskEvent::Deleted { .. } => "/tasks/delete",
        }
    }
}

/// Sink the embedding shim provides for publishing events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> FcResult<()>;
}

/// Bounded FIFO of pending events.
pub struct EventQueue {
    buf: Mutex<VecDeque<TaskEvent>>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event, dropping the oldest on overflow.
    pub fn push(&self, event: TaskEvent) {
        {
            let mut buf = self.buf.lock().unwrap();
            if buf.len() >= self.capacity {
                let dropped = buf.pop_front();
                tracing::warn!(?dropped, "event buffer full, dropping oldest event");
            }
            buf.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<TaskEvent> {
        self.buf.lock().unwrap().pop_front()
    }

    /// Wait for the next event.
    pub async fn pop(&self) -> TaskEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap().is_empty()
    }
}

/// Consume the queue and publish until cancelled. Publish failures are
/// logged and the loop continues.
pub fn spawn_forwarder(
    queue: Arc<EventQueue>,
    publisher: Arc<dyn EventPublisher>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = queue.pop() => event,
            };
            if let Err(err) = publisher.publish(event.topic(), &event).await {
                tracing::warn!(error = %err, topic = event.topic(), "failed to publish event");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn push_pop_is_fifo() {
        let queue = EventQueue::new(EVENT_BUFFER);
        queue.push(TaskEvent::Created {
            task_id: "a".into(),
            pid: 1,
        });
        queue.push(TaskEvent::Started {
            task_id: "a".into(),
            pid: 1,
        });

        assert!(matches!(queue.try_pop(), Some(TaskEvent::Created { .. })));
        assert!(matches!(queue.try_pop(), Some(TaskEvent::Started { .. })));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = EventQueue::new(2);
        for pid in 1..=3 {
            queue.push(TaskEvent::Created {
                task_id: format!("t{pid}"),
                pid,
            });
        }

        assert_eq!(queue.len(), 2);
        // t1 was dropped; t2 is now first.
        match queue.try_pop().unwrap() {
            TaskEvent::Created { task_id, .. } => assert_eq!(task_id, "t2"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn topics_match_event_kinds() {
        let event = TaskEvent::Exited {
            task_id: "t".into(),
            exit_status: 0,
        };
        assert_eq!(event.topic(), "/tasks/exit");
    }

    struct RecordingPublisher {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, _event: &TaskEvent) -> FcResult<()> {
            self.seen.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwarder_publishes_until_cancelled() {
        let queue = Arc::new(EventQueue::new(EVENT_BUFFER));
        let publisher = Arc::new(RecordingPublisher {
            seen: StdMutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_forwarder(queue.clone(), publisher.clone(), cancel.clone());

        queue.push(TaskEvent::Created {
            task_id: "t".into(),
            pid: 7,
        });
        queue.push(TaskEvent::Deleted {
            task_id: "t".into(),
        });

        // Let the forwarder drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let seen = publisher.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["/tasks/create", "/tasks/delete"]);
    }
}
