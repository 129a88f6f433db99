//! Progress fan-out from running jobs to live subscribers
//!
//! A single cooperative broker task owns all subscriber state. Workers
//! publish through a sink; subscribers get a bounded channel each. A full
//! subscriber queue drops the subscriber, never the event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{OptimizerPhase, ProgressEvent};

/// Receives progress events from a running optimization
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Sink for inline runs and tests
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Pluggable external republisher (multi-process deployments)
#[async_trait]
pub trait ProgressTransport: Send + Sync {
    async fn forward(&self, event: &ProgressEvent) -> Result<()>;
}

/// Republishes every event to a NATS subject keyed by job id
pub struct NatsProgressTransport {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsProgressTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subject_prefix: "fleetline.job.progress".to_string(),
        }
    }
}

#[async_trait]
impl ProgressTransport for NatsProgressTransport {
    async fn forward(&self, event: &ProgressEvent) -> Result<()> {
        let subject = format!("{}.{}", self.subject_prefix, event.job_id);
        let payload = serde_json::to_vec(event)?;
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }
}

/// Broker tuning knobs
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-subscriber minimum interval between throttled events
    pub min_interval: Duration,
    /// Progress delta that bypasses the interval throttle
    pub min_delta_pct: u8,
    /// Per-subscriber delivery queue length; overflow drops the subscriber
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1_000),
            min_delta_pct: 5,
            queue_capacity: 32,
        }
    }
}

/// A live subscription: bounded event stream plus the id used to
/// unsubscribe
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<ProgressEvent>,
}

enum BrokerMsg {
    Publish(ProgressEvent),
    Subscribe {
        job_id: Uuid,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        job_id: Uuid,
        subscriber_id: u64,
    },
}

/// Cloneable handle to the broker task
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerMsg>,
}

impl BrokerHandle {
    /// Non-blocking publish; events to a dead broker are dropped
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(BrokerMsg::Publish(event));
    }

    pub async fn subscribe(&self, job_id: Uuid) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerMsg::Subscribe { job_id, reply })
            .ok()?;
        rx.await.ok()
    }

    pub fn unsubscribe(&self, job_id: Uuid, subscriber_id: u64) {
        let _ = self.tx.send(BrokerMsg::Unsubscribe {
            job_id,
            subscriber_id,
        });
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
    last_sent: Option<Instant>,
    last_progress: u8,
    last_phase: OptimizerPhase,
}

#[derive(Default)]
struct JobFeed {
    last_event: Option<ProgressEvent>,
    subscribers: Vec<Subscriber>,
}

/// Single-task broker servicing a multi-producer event channel
pub struct ProgressBroker;

impl ProgressBroker {
    pub fn spawn(
        config: BrokerConfig,
        transport: Option<Arc<dyn ProgressTransport>>,
    ) -> BrokerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut feeds: HashMap<Uuid, JobFeed> = HashMap::new();
            let mut next_subscriber_id: u64 = 0;

            while let Some(msg) = rx.recv().await {
                match msg {
                    BrokerMsg::Publish(event) => {
                        if let Some(transport) = &transport {
                            if let Err(e) = transport.forward(&event).await {
                                warn!(job_id = %event.job_id, error = %e, "progress transport failed");
                            }
                        }
                        let feed = feeds.entry(event.job_id).or_default();
                        dispatch(feed, &event, &config);
                        let terminal = event.kind.is_terminal();
                        feed.last_event = Some(event);
                        if terminal {
                            // Closing the senders ends every live stream
                            feed.subscribers.clear();
                        }
                    }
                    BrokerMsg::Subscribe { job_id, reply } => {
                        next_subscriber_id += 1;
                        let id = next_subscriber_id;
                        let (event_tx, event_rx) =
                            mpsc::channel(config.queue_capacity.max(1));

                        let feed = feeds.entry(job_id).or_default();
                        let mut subscriber = Subscriber {
                            id,
                            tx: event_tx,
                            last_sent: None,
                            last_progress: 0,
                            last_phase: OptimizerPhase::Starting,
                        };

                        // Late subscribers immediately see the current state
                        let mut keep = true;
                        if let Some(last) = &feed.last_event {
                            keep = send_to(&mut subscriber, last);
                        }
                        let buffered_terminal = feed
                            .last_event
                            .as_ref()
                            .map(|e| e.kind.is_terminal())
                            .unwrap_or(false);
                        if keep && !buffered_terminal {
                            feed.subscribers.push(subscriber);
                        }

                        let _ = reply.send(Subscription {
                            id,
                            events: event_rx,
                        });
                    }
                    BrokerMsg::Unsubscribe {
                        job_id,
                        subscriber_id,
                    } => {
                        if let Some(feed) = feeds.get_mut(&job_id) {
                            feed.subscribers.retain(|s| s.id != subscriber_id);
                        }
                    }
                }
            }
        });

        BrokerHandle { tx }
    }
}

fn dispatch(feed: &mut JobFeed, event: &ProgressEvent, config: &BrokerConfig) {
    feed.subscribers.retain_mut(|subscriber| {
        if !should_send(subscriber, event, config) {
            return true;
        }
        send_to(subscriber, event)
    });
}

/// Throttle: deliver on terminal events, phase transitions, first event,
/// elapsed interval, or enough progress delta — whichever comes first
fn should_send(subscriber: &Subscriber, event: &ProgressEvent, config: &BrokerConfig) -> bool {
    if event.kind.is_terminal() {
        return true;
    }
    if subscriber.last_sent.is_none() {
        return true;
    }
    if event.phase != subscriber.last_phase {
        return true;
    }
    if subscriber
        .last_sent
        .map(|t| t.elapsed() >= config.min_interval)
        .unwrap_or(true)
    {
        return true;
    }
    event.progress.saturating_sub(subscriber.last_progress) >= config.min_delta_pct
}

/// Returns false when the subscriber must be dropped
fn send_to(subscriber: &mut Subscriber, event: &ProgressEvent) -> bool {
    match subscriber.tx.try_send(event.clone()) {
        Ok(()) => {
            subscriber.last_sent = Some(Instant::now());
            subscriber.last_progress = event.progress;
            subscriber.last_phase = event.phase;
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(subscriber = subscriber.id, "slow subscriber dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressKind;

    fn event(job_id: Uuid, phase: OptimizerPhase, progress: u8) -> ProgressEvent {
        ProgressEvent::progress(job_id, phase, progress, "working")
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        handle.publish(event(job_id, OptimizerPhase::Starting, 0));

        let received = subscription.events.recv().await.unwrap();
        assert_eq!(received.job_id, job_id);
        assert_eq!(received.progress, 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_buffered_state() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        handle.publish(event(job_id, OptimizerPhase::BuildingChains, 40));
        // Give the broker task a tick to process
        tokio::task::yield_now().await;

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        let received = subscription.events.recv().await.unwrap();
        assert_eq!(received.phase, OptimizerPhase::BuildingChains);
        assert_eq!(received.progress, 40);
    }

    #[tokio::test]
    async fn test_small_deltas_are_throttled() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        handle.publish(event(job_id, OptimizerPhase::LocalSearch, 80));
        handle.publish(event(job_id, OptimizerPhase::LocalSearch, 81));
        handle.publish(event(job_id, OptimizerPhase::LocalSearch, 82));
        // Big enough delta to bypass the interval throttle
        handle.publish(event(job_id, OptimizerPhase::LocalSearch, 88));

        let first = subscription.events.recv().await.unwrap();
        assert_eq!(first.progress, 80);
        let second = subscription.events.recv().await.unwrap();
        assert_eq!(second.progress, 88);
    }

    #[tokio::test]
    async fn test_phase_transition_bypasses_throttle() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        handle.publish(event(job_id, OptimizerPhase::Preprocessing, 5));
        handle.publish(event(job_id, OptimizerPhase::TravelMatrix, 6));

        let first = subscription.events.recv().await.unwrap();
        assert_eq!(first.phase, OptimizerPhase::Preprocessing);
        let second = subscription.events.recv().await.unwrap();
        assert_eq!(second.phase, OptimizerPhase::TravelMatrix);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_stream() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        handle.publish(event(job_id, OptimizerPhase::LocalSearch, 85));
        handle.publish(ProgressEvent::completed(job_id, "done"));

        let first = subscription.events.recv().await.unwrap();
        assert_eq!(first.progress, 85);
        let terminal = subscription.events.recv().await.unwrap();
        assert_eq!(terminal.kind, ProgressKind::Completed);
        assert_eq!(terminal.progress, 100);
        // Stream ends after the terminal event
        assert!(subscription.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_after_completion_replays_terminal() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        handle.publish(ProgressEvent::completed(job_id, "done"));
        tokio::task::yield_now().await;

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        let replayed = subscription.events.recv().await.unwrap();
        assert_eq!(replayed.kind, ProgressKind::Completed);
        assert!(subscription.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_not_blocking() {
        let config = BrokerConfig {
            queue_capacity: 1,
            min_interval: Duration::from_millis(0),
            min_delta_pct: 0,
        };
        let handle = ProgressBroker::spawn(config, None);
        let job_id = Uuid::new_v4();

        // Never read from the subscription: the queue fills at once
        let mut subscription = handle.subscribe(job_id).await.unwrap();
        for i in 0..5 {
            handle.publish(event(job_id, OptimizerPhase::LocalSearch, 80 + i));
        }
        tokio::task::yield_now().await;

        // The first event fits the queue; after the overflow the
        // subscriber is gone and the stream ends
        let first = subscription.events.recv().await.unwrap();
        assert_eq!(first.progress, 80);
        assert!(subscription.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let handle = ProgressBroker::spawn(BrokerConfig::default(), None);
        let job_id = Uuid::new_v4();

        let mut subscription = handle.subscribe(job_id).await.unwrap();
        handle.unsubscribe(job_id, subscription.id);
        tokio::task::yield_now().await;

        handle.publish(event(job_id, OptimizerPhase::Starting, 0));
        assert!(subscription.events.recv().await.is_none());
    }
}
