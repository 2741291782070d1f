//! Configuration for the producer client.

use std::time::Duration;

use crate::compression::CompressionType;
use crate::message_set::MessageSet;

/// Producer client configuration.
///
/// `max_message_size` must agree with the broker's `max.message.bytes` for
/// the topics produced to; the broker does not report it in metadata.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Broker addresses as `host[:port]`; port defaults to 9092.
    pub brokers: Vec<String>,
    /// Client id sent in every request header.
    pub client_id: String,
    /// Deadline for TCP connect and for the metadata fetch that rides on a
    /// fresh connection.
    pub connect_timeout: Duration,
    /// Ack deadline sent to the broker in each produce request.
    pub produce_timeout: Duration,
    /// Extra local wait on top of `produce_timeout`, covering network round
    /// trip; the broker may legitimately take the whole `produce_timeout`
    /// before answering.
    pub produce_timeout_rtt_allowance: Duration,
    /// Extra attempts for a failed metadata fetch. Each attempt may land on
    /// a different broker; there is no delay between them.
    pub retry_attempts: u32,
    /// How many replicas must ack each produce request: -1 all in-sync
    /// replicas, 0 none (fire and forget), 1 leader only.
    pub required_acks: i16,
    /// Compression applied to each message set built by the client.
    pub compression: CompressionType,
    /// Byte budget for each message set built by the client.
    pub max_message_size: usize,
    /// Worker threads for the client's internal runtime.
    pub io_threads: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "kafsink".to_string(),
            connect_timeout: Duration::from_secs(1),
            produce_timeout: Duration::from_secs(10),
            produce_timeout_rtt_allowance: Duration::from_millis(500),
            retry_attempts: 1,
            required_acks: -1,
            compression: CompressionType::None,
            max_message_size: MessageSet::DEFAULT_MAX_MESSAGE_SIZE,
            io_threads: 1,
        }
    }
}

/// Builder for [`ProducerConfig`].
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Comma-separated `host[:port]` list, the same format the broker tools
    /// accept.
    pub fn broker_list(mut self, brokers: &str) -> Self {
        self.config.brokers = brokers.split(',').map(|s| s.trim().to_string()).collect();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn produce_timeout(mut self, timeout: Duration) -> Self {
        self.config.produce_timeout = timeout;
        self
    }

    pub fn produce_timeout_rtt_allowance(mut self, allowance: Duration) -> Self {
        self.config.produce_timeout_rtt_allowance = allowance;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    pub fn required_acks(mut self, acks: i16) -> Self {
        self.config.required_acks = acks;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}
