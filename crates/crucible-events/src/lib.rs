//! The event bus: publish/subscribe glue between the dispatcher, cleanup
//! controller, storage worker, and the SSE stream.
//!
//! In-process the bus is a `tokio::sync::broadcast` channel. Publishing is
//! fire-and-forget: a send with no subscribers is not an error, and a lagged
//! subscriber drops messages rather than blocking producers. Durability is
//! NOT provided here — the storage worker's write is the durable fence. A
//! pluggable [`EventSink`] lets a deployment forward the same stream into an
//! external broker without touching producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crucible_schemas::{lifecycle_sequence, EvalId, EventKind};

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// One event as it travels the bus and (for lifecycle kinds) lands in the
/// events table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusEvent {
    pub eval_id: EvalId,
    /// Per-evaluation, producer-assigned. Fixed per lifecycle kind so that
    /// duplicate delivery collapses at the consumer.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Value,
}

impl BusEvent {
    /// Build a lifecycle event with its fixed sequence.
    ///
    /// Panics only if called with a non-lifecycle kind, which is a
    /// programming error (use [`BusEvent::signal`] for those).
    pub fn lifecycle(eval_id: EvalId, kind: EventKind, payload: Value) -> Self {
        let sequence = lifecycle_sequence(kind)
            .unwrap_or_else(|| panic!("{kind:?} is not a lifecycle kind"));
        Self {
            eval_id,
            sequence,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    /// Non-lifecycle signal (`workload.cleaned`, `storage.updated`).
    /// Sequence 0: never appended to the events table.
    pub fn signal(eval_id: EvalId, kind: EventKind, payload: Value) -> Self {
        Self {
            eval_id,
            sequence: 0,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Cloneable handle to the in-process broker.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. The return value of the underlying send is
    /// deliberately ignored: no subscriber is a valid state.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Forwarding seam for a durable external broker. The core never awaits a
/// sink on its hot path; a forwarder task drains a subscription into one.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &BusEvent) -> anyhow::Result<()>;
}

/// Spawn a task pumping every bus event into `sink`. Lagged windows are
/// logged and skipped; delivery errors are logged and do not stop the pump.
pub fn spawn_forwarder(
    bus: &EventBus,
    sink: std::sync::Arc<dyn EventSink>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(err) = sink.deliver(&event).await {
                        tracing::warn!(eval_id = %event.eval_id, error = %err, "event sink delivery failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event sink lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> EvalId {
        EvalId::new(s)
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new(8);
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Queued, json!({})));
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Queued, json!({})));
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Provisioning, json!({})));
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Running, json!({})));

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
        assert_eq!(rx.recv().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(8);
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Queued, json!({})));

        let mut rx = bus.subscribe();
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Running, json!({})));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Running);
    }

    #[test]
    fn signal_events_carry_sequence_zero() {
        let e = BusEvent::signal(id("e1"), EventKind::WorkloadCleaned, json!({"reason": "ttl"}));
        assert_eq!(e.sequence, 0);
        assert_eq!(e.topic(), "workload.cleaned");
    }

    #[tokio::test]
    async fn forwarder_pumps_the_bus_into_a_sink() {
        struct CollectSink(std::sync::Mutex<Vec<u64>>);

        #[async_trait::async_trait]
        impl EventSink for CollectSink {
            async fn deliver(&self, event: &BusEvent) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(event.sequence);
                Ok(())
            }
        }

        let bus = EventBus::new(8);
        let sink = std::sync::Arc::new(CollectSink(std::sync::Mutex::new(Vec::new())));
        let _pump = spawn_forwarder(&bus, sink.clone());

        // Give the pump a beat to subscribe before publishing.
        tokio::task::yield_now().await;
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Queued, json!({})));
        bus.publish(BusEvent::lifecycle(id("e1"), EventKind::Running, json!({})));

        for _ in 0..100 {
            if sink.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 3]);
    }
}
