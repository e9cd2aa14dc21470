//! Notification bus carrying terminal upload outcomes.
//!
//! Two topics exist: `url-update` with payload `"<photo id>-<url>"` and
//! `delete` with payload `"<photo id>"`. Payloads are plain ASCII so any
//! producer can emit them.

use crate::config::KafkaConfig;
use crate::error::{BusError, MessageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// The two well-known topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    UrlUpdate,
    Delete,
}

/// Topic names as configured on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub url_update: String,
    pub delete: String,
}

impl Topics {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            url_update: config.url_update_topic.clone(),
            delete: config.delete_topic.clone(),
        }
    }

    pub fn name(&self, topic: Topic) -> &str {
        match topic {
            Topic::UrlUpdate => &self.url_update,
            Topic::Delete => &self.delete,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Topic> {
        if name == self.url_update {
            Some(Topic::UrlUpdate)
        } else if name == self.delete {
            Some(Topic::Delete)
        } else {
            None
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            url_update: "url-update".to_string(),
            delete: "delete".to_string(),
        }
    }
}

/// Terminal outcome of one upload job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Transfer succeeded; the photo is reachable at `url`
    UrlUpdate { photo_id: i64, url: String },
    /// Transfer failed; the pending photo row must go
    Delete { photo_id: i64 },
}

impl Outcome {
    pub fn topic(&self) -> Topic {
        match self {
            Outcome::UrlUpdate { .. } => Topic::UrlUpdate,
            Outcome::Delete { .. } => Topic::Delete,
        }
    }

    pub fn photo_id(&self) -> i64 {
        match self {
            Outcome::UrlUpdate { photo_id, .. } | Outcome::Delete { photo_id } => *photo_id,
        }
    }

    /// Wire payload for the outcome's topic
    pub fn payload(&self) -> String {
        match self {
            Outcome::UrlUpdate { photo_id, url } => format!("{photo_id}-{url}"),
            Outcome::Delete { photo_id } => photo_id.to_string(),
        }
    }

    /// Parse a payload received on `topic`. A url-update payload is split on
    /// its first `-`, so URLs may themselves contain dashes.
    pub fn parse(topic: Topic, payload: &str) -> Result<Self, MessageError> {
        match topic {
            Topic::UrlUpdate => {
                let (id, url) = payload
                    .split_once('-')
                    .ok_or_else(|| MessageError::MissingUrl(payload.to_string()))?;
                if url.is_empty() {
                    return Err(MessageError::MissingUrl(payload.to_string()));
                }
                Ok(Outcome::UrlUpdate {
                    photo_id: parse_photo_id(id)?,
                    url: url.to_string(),
                })
            }
            Topic::Delete => Ok(Outcome::Delete {
                photo_id: parse_photo_id(payload)?,
            }),
        }
    }
}

fn parse_photo_id(raw: &str) -> Result<i64, MessageError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| MessageError::InvalidPhotoId(raw.to_string()))
}

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic name the message arrived on
    pub topic: String,
    pub payload: String,
    pub partition: i32,
    pub offset: i64,
}

/// Publishing side of the bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Publish an outcome on its topic
    async fn publish(&self, outcome: &Outcome) -> Result<(), BusError>;
}

/// Consuming side of the bus. Messages from both topics arrive through one
/// subscription; ordering holds per topic only.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. `None` means the bus is gone.
    async fn next_message(&mut self) -> Option<Result<BusMessage, BusError>>;

    /// Mark a message as handled
    fn commit(&mut self, message: &BusMessage) -> Result<(), BusError>;
}

/// Kafka client settings shared by producer and consumer
fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);

    // Configure SSL if enabled
    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    // Configure SASL if credentials provided
    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

/// Kafka-backed publisher
pub struct KafkaBus {
    producer: FutureProducer,
    topics: Topics,
    timeout: Duration,
}

impl KafkaBus {
    pub fn new(config: &KafkaConfig) -> Result<Self, BusError> {
        let producer: FutureProducer = base_client_config(config)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| BusError::Publish {
                topic: "*".to_string(),
                message: e.to_string(),
            })?;

        info!(bootstrap_servers = %config.bootstrap_servers, "Kafka producer created");

        Ok(Self {
            producer,
            topics: Topics::from_config(config),
            timeout: config.message_timeout(),
        })
    }
}

#[async_trait]
impl NotificationBus for KafkaBus {
    #[instrument(skip(self), fields(photo_id = outcome.photo_id()))]
    async fn publish(&self, outcome: &Outcome) -> Result<(), BusError> {
        let topic = self.topics.name(outcome.topic());
        let key = outcome.photo_id().to_string();
        let payload = outcome.payload();

        // Keyed by photo id so every outcome of one photo lands on one partition
        let record = FutureRecord::to(topic).key(&key).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic = %topic, partition, offset, "Outcome published");
        Ok(())
    }
}

impl Drop for KafkaBus {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

/// Kafka consumer subscribed to both outcome topics
pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaSubscription {
    pub fn new(config: &KafkaConfig) -> Result<Self, BusError> {
        let consumer: StreamConsumer = base_client_config(config)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let topics = [
            config.url_update_topic.as_str(),
            config.delete_topic.as_str(),
        ];
        consumer
            .subscribe(&topics)
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        info!(
            topics = ?topics,
            group = %config.consumer_group,
            "Subscribed to outcome topics"
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_message(&mut self) -> Option<Result<BusMessage, BusError>> {
        let received = match self.consumer.recv().await {
            Ok(message) => Ok(BusMessage {
                topic: message.topic().to_string(),
                payload: message
                    .payload()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default(),
                partition: message.partition(),
                offset: message.offset(),
            }),
            Err(e) => Err(BusError::Receive(e.to_string())),
        };
        Some(received)
    }

    fn commit(&mut self, message: &BusMessage) -> Result<(), BusError> {
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| BusError::Commit(e.to_string()))?;

        self.consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| BusError::Commit(e.to_string()))
    }
}

/// In-process bus with one FIFO channel per topic
pub struct MemoryBus {
    topics: Topics,
    url_updates: mpsc::UnboundedSender<String>,
    deletes: mpsc::UnboundedSender<String>,
    receivers: Mutex<Option<MemorySubscription>>,
    published: Mutex<Vec<Outcome>>,
    fail_publishes: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        let topics = Topics::default();
        let (url_updates, url_rx) = mpsc::unbounded_channel();
        let (deletes, delete_rx) = mpsc::unbounded_channel();

        Self {
            receivers: Mutex::new(Some(MemorySubscription {
                topics: topics.clone(),
                url_updates: url_rx,
                deletes: delete_rx,
                sequence: 0,
                committed: 0,
            })),
            topics,
            url_updates,
            deletes,
            published: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Take the single subscription of this bus
    pub fn subscribe(&self) -> Option<MemorySubscription> {
        self.receivers.lock().take()
    }

    /// Make every subsequent publish fail
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Outcomes published so far, in order
    pub fn published(&self) -> Vec<Outcome> {
        self.published.lock().clone()
    }

    /// Inject a raw payload on a topic, bypassing outcome encoding
    pub fn publish_raw(&self, topic: Topic, payload: impl Into<String>) {
        let sender = match topic {
            Topic::UrlUpdate => &self.url_updates,
            Topic::Delete => &self.deletes,
        };
        if sender.send(payload.into()).is_err() {
            debug!(topic = %self.topics.name(topic), "No subscriber for raw payload");
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn publish(&self, outcome: &Outcome) -> Result<(), BusError> {
        let topic = self.topics.name(outcome.topic()).to_string();
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic,
                message: "bus unavailable".to_string(),
            });
        }

        self.publish_raw(outcome.topic(), outcome.payload());
        self.published.lock().push(outcome.clone());
        Ok(())
    }
}

/// Subscription half of a [`MemoryBus`]
pub struct MemorySubscription {
    topics: Topics,
    url_updates: mpsc::UnboundedReceiver<String>,
    deletes: mpsc::UnboundedReceiver<String>,
    sequence: i64,
    committed: usize,
}

impl MemorySubscription {
    /// Number of messages committed
    pub fn committed(&self) -> usize {
        self.committed
    }

    fn wrap(&mut self, topic: Topic, payload: String) -> BusMessage {
        self.sequence += 1;
        BusMessage {
            topic: self.topics.name(topic).to_string(),
            payload,
            partition: 0,
            offset: self.sequence,
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<Result<BusMessage, BusError>> {
        // Suspends until either topic has a message
        let (topic, payload) = tokio::select! {
            Some(payload) = self.url_updates.recv() => (Topic::UrlUpdate, payload),
            Some(payload) = self.deletes.recv() => (Topic::Delete, payload),
            else => return None,
        };
        Some(Ok(self.wrap(topic, payload)))
    }

    fn commit(&mut self, _message: &BusMessage) -> Result<(), BusError> {
        self.committed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_update_payload() {
        let outcome = Outcome::UrlUpdate {
            photo_id: 42,
            url: "https://acct.blob.core.windows.net/container/a.jpg".to_string(),
        };
        assert_eq!(
            outcome.payload(),
            "42-https://acct.blob.core.windows.net/container/a.jpg"
        );
        assert_eq!(outcome.topic(), Topic::UrlUpdate);
    }

    #[test]
    fn test_parse_splits_on_first_dash() {
        let outcome = Outcome::parse(
            Topic::UrlUpdate,
            "42-https://acct.blob.core.windows.net/my-container/a-b.jpg",
        )
        .unwrap();

        assert_eq!(
            outcome,
            Outcome::UrlUpdate {
                photo_id: 42,
                url: "https://acct.blob.core.windows.net/my-container/a-b.jpg".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_delete() {
        assert_eq!(
            Outcome::parse(Topic::Delete, "42").unwrap(),
            Outcome::Delete { photo_id: 42 }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert_eq!(
            Outcome::parse(Topic::UrlUpdate, "42"),
            Err(MessageError::MissingUrl("42".to_string()))
        );
        assert_eq!(
            Outcome::parse(Topic::UrlUpdate, "42-"),
            Err(MessageError::MissingUrl("42-".to_string()))
        );
        assert!(matches!(
            Outcome::parse(Topic::UrlUpdate, "abc-https://x"),
            Err(MessageError::InvalidPhotoId(_))
        ));
        assert!(matches!(
            Outcome::parse(Topic::Delete, "-3"),
            Err(MessageError::InvalidPhotoId(_))
        ));
    }

    #[test]
    fn test_topic_resolution() {
        let topics = Topics::default();
        assert_eq!(topics.resolve("url-update"), Some(Topic::UrlUpdate));
        assert_eq!(topics.resolve("delete"), Some(Topic::Delete));
        assert_eq!(topics.resolve("alerts"), None);
        assert_eq!(topics.name(Topic::Delete), "delete");
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_both_topics() {
        let bus = MemoryBus::new();
        let mut subscription = bus.subscribe().unwrap();

        bus.publish(&Outcome::Delete { photo_id: 1 }).await.unwrap();
        bus.publish(&Outcome::UrlUpdate {
            photo_id: 2,
            url: "https://x/y".to_string(),
        })
        .await
        .unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let message = subscription.next_message().await.unwrap().unwrap();
            subscription.commit(&message).unwrap();
            received.push((message.topic, message.payload));
        }
        received.sort();

        assert_eq!(
            received,
            vec![
                ("delete".to_string(), "1".to_string()),
                ("url-update".to_string(), "2-https://x/y".to_string()),
            ]
        );
        assert_eq!(subscription.committed(), 2);
        assert!(bus.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_memory_bus_keeps_topic_order() {
        let bus = MemoryBus::new();
        let mut subscription = bus.subscribe().unwrap();

        for photo_id in 1..=3 {
            bus.publish(&Outcome::Delete { photo_id }).await.unwrap();
        }

        for expected in ["1", "2", "3"] {
            let message = subscription.next_message().await.unwrap().unwrap();
            assert_eq!(message.payload, expected);
        }
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_delivered() {
        let bus = MemoryBus::new();
        bus.fail_publishes(true);

        let result = bus.publish(&Outcome::Delete { photo_id: 9 }).await;
        assert!(matches!(result, Err(BusError::Publish { .. })));
        assert!(bus.published().is_empty());
    }
}
