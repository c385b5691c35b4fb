use std::sync::Arc;

use smsgate_core::Event;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::history::NotificationHistory;
use crate::sink::{EventSink, SinkError};

/// An event on its way to the sink, with the channel its result goes back on.
struct Delivery {
    event: Event,
    ack: oneshot::Sender<Result<(), SinkError>>,
}

/// Cloneable handle device monitors publish through.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Delivery>,
}

impl EventPublisher {
    /// Hand `event` to the sink and wait for its verdict.
    pub async fn publish(&self, event: Event) -> Result<(), SinkError> {
        let (ack, verdict) = oneshot::channel();
        self.tx
            .send(Delivery { event, ack })
            .await
            .map_err(|_| SinkError::Closed)?;
        verdict.await.map_err(|_| SinkError::Closed)?
    }
}

/// Start the task that feeds every published event to `sink`, one at a time
/// in arrival order. Accepted events are then written to `history`.
///
/// The task ends once every [`EventPublisher`] is dropped.
pub fn spawn_dispatcher(
    sink: Arc<dyn EventSink>,
    history: Option<NotificationHistory>,
    buffer: usize,
) -> (EventPublisher, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Delivery>(buffer);

    let handle = tokio::spawn(async move {
        while let Some(Delivery { event, ack }) = rx.recv().await {
            let result = sink.publish(&event).await;
            let accepted = result.is_ok();

            match &result {
                Ok(()) => info!(
                    device = event.device(),
                    kind = event.kind().as_str(),
                    number = event.number(),
                    "event forwarded"
                ),
                Err(e) => warn!(
                    device = event.device(),
                    kind = event.kind().as_str(),
                    error = %e,
                    "event delivery failed"
                ),
            }
            let _ = ack.send(result);

            if let (true, Some(history)) = (accepted, &history) {
                if let Err(e) = history.record(&event).await {
                    warn!(error = %e, "failed to record notification history");
                }
            }
        }
        debug!("event dispatcher stopped");
    });

    (EventPublisher { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use smsgate_core::{CallDirection, CallEvent, CallType, EventId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        fail: bool,
        seen: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for Recording {
        async fn publish(&self, event: &Event) -> Result<(), SinkError> {
            self.seen.lock().unwrap().push(event.clone());
            if self.fail {
                Err(SinkError::Rejected("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn call() -> Event {
        Event::Call(CallEvent {
            id: EventId::new(),
            device: "a".into(),
            caller_number: "+1".into(),
            direction: CallDirection::Incoming,
            call_type: CallType::Voice,
            timestamp: jiff::Timestamp::now(),
        })
    }

    #[tokio::test]
    async fn verdict_reaches_publisher() {
        let sink = Arc::new(Recording::default());
        let history = NotificationHistory::new_in_memory().await.unwrap();
        let (publisher, handle) = spawn_dispatcher(sink.clone(), Some(history.clone()), 8);

        publisher.publish(call()).await.unwrap();
        drop(publisher);
        handle.await.unwrap();

        assert_eq!(sink.seen.lock().unwrap().len(), 1);
        assert_eq!(history.stats().await.unwrap().calls, 1);
    }

    #[tokio::test]
    async fn rejected_events_are_not_recorded() {
        let sink = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let history = NotificationHistory::new_in_memory().await.unwrap();
        let (publisher, handle) = spawn_dispatcher(sink, Some(history.clone()), 8);

        let err = publisher.publish(call()).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
        drop(publisher);
        handle.await.unwrap();

        assert_eq!(history.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_closed() {
        let (publisher, handle) = spawn_dispatcher(Arc::new(Recording::default()), None, 1);
        handle.abort();
        let _ = handle.await;

        assert!(matches!(
            publisher.publish(call()).await,
            Err(SinkError::Closed)
        ));
    }
}
