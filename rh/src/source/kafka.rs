//! Kafka-backed upstream stream

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};
use tracing::{debug, info};

use super::{UpstreamConfig, UpstreamError, UpstreamStream};

/// Consumes CDC records from one Kafka topic
pub struct KafkaStream {
    config: UpstreamConfig,
    consumer: Option<StreamConsumer>,
}

impl KafkaStream {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config, consumer: None }
    }
}

#[async_trait]
impl UpstreamStream for KafkaStream {
    async fn connect(&mut self) -> Result<(), UpstreamError> {
        debug!(brokers = %self.config.brokers, topic = %self.config.topic, "KafkaStream::connect: called");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("client.id", &self.config.client_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| UpstreamError::ConnectionLost(e.to_string()))?;

        consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| UpstreamError::ConnectionLost(e.to_string()))?;

        info!(topic = %self.config.topic, group_id = %self.config.group_id, "Subscribed to upstream topic");
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, UpstreamError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| UpstreamError::ConnectionLost("not connected".to_string()))?;

        match consumer.recv().await {
            Ok(message) => match message.payload() {
                Some(payload) => Ok(Some(payload.to_vec())),
                None => Err(UpstreamError::MalformedRecord(format!(
                    "empty record at partition {} offset {}",
                    message.partition(),
                    message.offset()
                ))),
            },
            Err(e) => Err(UpstreamError::ConnectionLost(e.to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            debug!("KafkaStream::disconnect: unsubscribing");
            consumer.unsubscribe();
        }
    }
}
