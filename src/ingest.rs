//! Ingest pipeline
//!
//! Fan-in point for every event entering the system: broker-originated
//! messages from the pool and mapper-generated messages alike. Each event
//! is appended to the store and broadcast to the mapper engine, the alert
//! engine and the hub. A failure on one event never stalls the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::Payload;
use crate::store::Store;
use crate::topic::is_sparkplug_topic;
use crate::types::Event;

/// Capacity of the fan-out channel. Slow subscribers lag and skip rather
/// than exert back-pressure on ingest.
pub const FANOUT_CAPACITY: usize = 4_096;

/// Run the ingest loop until the channel closes or cancellation fires.
pub async fn run_ingest(
    store: Arc<Store>,
    mut rx: mpsc::Receiver<Event>,
    fanout: broadcast::Sender<Arc<Event>>,
    cancel: CancellationToken,
) {
    info!("Ingest pipeline started");
    let mut seq_tracker: HashMap<String, u64> = HashMap::new();
    let mut ingested = 0u64;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!(ingested, "Ingest pipeline stopping");
                return;
            }
            received = rx.recv() => match received {
                Some(event) => event,
                None => {
                    info!(ingested, "Ingest channel closed");
                    return;
                }
            },
        };

        if is_sparkplug_topic(&event.topic) {
            check_sparkplug_seq(&mut seq_tracker, &event);
        }

        if let Err(e) = store.append_event(&event) {
            warn!(
                topic = %event.topic,
                broker_id = %event.broker_id,
                error = %e,
                "Event append failed, continuing"
            );
        }
        ingested += 1;

        // Lagging subscribers are their own problem; ingest never blocks.
        let _ = fanout.send(Arc::new(event));
    }
}

/// Sparkplug-B `seq` wraps at 255 and resets on BIRTH. Gaps are warned
/// about and processing continues.
fn check_sparkplug_seq(tracker: &mut HashMap<String, u64>, event: &Event) {
    let Payload::Sparkplug(sp) = event.decode_payload() else {
        return;
    };
    let Some(seq) = sp.seq else {
        return;
    };

    let key = format!("{}:{}", event.broker_id, event.topic);
    if event.topic.contains("/NBIRTH/") || event.topic.contains("/DBIRTH/") {
        tracker.insert(key, seq);
        return;
    }

    if let Some(previous) = tracker.insert(key, seq) {
        let expected = (previous + 1) % 256;
        if seq != expected {
            warn!(
                broker_id = %event.broker_id,
                topic = %event.topic,
                expected,
                got = seq,
                "Sparkplug seq gap"
            );
        }
    }
}

/// Shorthand for building the ingest channel pair used by the pool and the
/// mapper's generated-event path.
pub fn channels() -> (
    mpsc::Sender<Event>,
    mpsc::Receiver<Event>,
    broadcast::Sender<Arc<Event>>,
) {
    let (tx, rx) = mpsc::channel(FANOUT_CAPACITY);
    let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
    (tx, rx, fanout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn events_are_stored_and_broadcast() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (tx, rx, fanout) = channels();
        let mut sub = fanout.subscribe();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_ingest(
            Arc::clone(&store),
            rx,
            fanout.clone(),
            cancel.clone(),
        ));

        tx.send(Event::new("b1", "a/b", b"{\"v\":1}".to_vec()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic, "a/b");
        assert!(store.get_latest(Some("b1"), "a/b").unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_survives_malformed_payloads() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (tx, rx, fanout) = channels();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ingest(
            Arc::clone(&store),
            rx,
            fanout.clone(),
            cancel.clone(),
        ));

        // Invalid Sparkplug bytes on a Sparkplug topic, then a normal event.
        tx.send(Event::new("b1", "spBv1.0/g/NDATA/n", vec![0xFF; 4]))
            .await
            .unwrap();
        tx.send(Event::new("b1", "plant/ok", b"1".to_vec()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get_latest(None, "plant/ok").unwrap().is_some());
        assert!(store.get_latest(None, "spBv1.0/g/NDATA/n").unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
