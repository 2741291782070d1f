//! # kafsink
//!
//! A synchronous producer client for Kafka 0.8 wire-protocol brokers.
//!
//! The design is inverted relative to most producer libraries: the API is
//! blocking on the outside, asynchronous on the inside. Each public call
//! parks the calling thread until the batch has been durably acknowledged
//! by the partition leader, failed with a concrete reason, or timed out,
//! while internally a tokio core multiplexes any number of caller threads
//! onto one pipelined TCP connection per broker.
//!
//! ## What it does
//!
//! - **One connection per broker**, owned by an actor task that writes
//!   requests strictly in submission order and matches responses back by
//!   correlation id.
//! - **Leadership tracking**: a metadata cache maps each (topic, partition)
//!   to its current leader, invalidated on leadership errors and refreshed
//!   on demand. The client never retries on its own; the caller drives
//!   retry policy with full visibility into what failed.
//! - **0.8 message sets** with per-record CRC32 and whole-batch GZIP or
//!   Snappy compression, built under a byte budget that matches the
//!   broker's `max.message.bytes`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kafsink::{CompressionType, ProducerClient};
//!
//! fn main() -> kafsink::Result<()> {
//!     let client = ProducerClient::builder()
//!         .broker_list("kafka-1:9092,kafka-2:9092")
//!         .client_id("billing-writer")
//!         .compression(CompressionType::Snappy)
//!         .required_acks(-1)
//!         .build()?;
//!
//!     let mut batch = client.message_set();
//!     batch.push("first event", None)?;
//!     batch.push("second event", Some("account-7".into()))?;
//!
//!     match client.produce("billing-events", 0, &batch) {
//!         Ok(offset) => println!("batch landed at offset {offset}"),
//!         Err(err) if err.is_retriable() => eprintln!("retry later: {err}"),
//!         Err(err) => return Err(err),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Public calls block and must not be made from inside an async context.

pub mod broker;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod message_set;
pub mod metadata;
pub mod metrics;
pub mod producer;
pub mod protocol;

pub use compression::CompressionType;
pub use config::{ProducerConfig, ProducerConfigBuilder};
pub use error::{BrokerErrorCode, ClientError};
pub use message_set::{Message, MessageSet};
pub use producer::{ProducerClient, ProducerClientBuilder};

/// Client library result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
