//! Request and response types for the two RPCs a producer needs: Metadata
//! (api key 3) to discover partition leadership, and Produce (api key 0).
//!
//! Request framing on the wire is
//! `{len: i32, api_key: i16, api_version: i16, correlation_id: i32,
//! client_id: string, body}` where `len` covers everything after itself;
//! response framing is `{len: i32, correlation_id: i32, body}`. The framing
//! itself is handled by the broker connection; the types here encode and
//! decode the bodies and the request header.

use std::fmt;

use crate::codec::{Decoder, Encoder, WireError};
use crate::message_set::MessageSet;

/// Protocol RPC ids.
pub mod api_key {
    pub const PRODUCE: i16 = 0;
    pub const METADATA: i16 = 3;
}

/// All 0.8 requests go out as api version 0.
pub const API_VERSION: i16 = 0;

/// A broker endpoint as named by the cluster.
///
/// `node_id` 0 is used for bootstrap brokers parsed from configuration;
/// real node ids come from metadata responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerIdentity {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl fmt::Display for BrokerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (node {})", self.host, self.port, self.node_id)
    }
}

/// Header sent ahead of every request body.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

impl RequestHeader {
    pub fn encode(&self, enc: &mut Encoder) -> Result<(), WireError> {
        enc.put_i16(self.api_key);
        enc.put_i16(self.api_version);
        enc.put_i32(self.correlation_id);
        enc.put_string(Some(&self.client_id))?;
        Ok(())
    }
}

/// Metadata request body. An empty topic list asks for all topics.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    pub topics: Vec<String>,
}

impl MetadataRequest {
    pub fn encode(&self, enc: &mut Encoder) -> Result<(), WireError> {
        enc.put_array_len(self.topics.len())?;
        for topic in &self.topics {
            enc.put_string(Some(topic))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub error_code: i16,
    pub partition_id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub error_code: i16,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerIdentity>,
    pub topics: Vec<TopicMetadata>,
}

impl MetadataResponse {
    pub fn decode(dec: &mut Decoder) -> Result<Self, WireError> {
        let broker_count = dec.get_array_len()?;
        let mut brokers = Vec::with_capacity(broker_count);
        for _ in 0..broker_count {
            let node_id = dec.get_i32()?;
            let host = required_string(dec)?;
            let port = dec.get_i32()?;
            brokers.push(BrokerIdentity {
                node_id,
                host,
                port,
            });
        }

        let topic_count = dec.get_array_len()?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let error_code = dec.get_i16()?;
            let name = required_string(dec)?;
            let partition_count = dec.get_array_len()?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                partitions.push(PartitionMetadata {
                    error_code: dec.get_i16()?,
                    partition_id: dec.get_i32()?,
                    leader: dec.get_i32()?,
                    replicas: decode_i32_array(dec)?,
                    isr: decode_i32_array(dec)?,
                });
            }
            topics.push(TopicMetadata {
                error_code,
                name,
                partitions,
            });
        }

        Ok(Self { brokers, topics })
    }
}

/// Produce request body targeting one (topic, partition).
///
/// The wire format allows many topics and partitions per request; this
/// client produces to exactly one per call, so the arrays always have a
/// single element.
#[derive(Debug)]
pub struct ProduceRequest<'a> {
    pub required_acks: i16,
    pub timeout_ms: i32,
    pub topic: &'a str,
    pub partition_id: i32,
    pub messages: &'a MessageSet,
}

impl ProduceRequest<'_> {
    pub fn encode(&self, enc: &mut Encoder) -> Result<(), WireError> {
        enc.put_i16(self.required_acks);
        enc.put_i32(self.timeout_ms);
        enc.put_array_len(1)?;
        enc.put_string(Some(self.topic))?;
        enc.put_array_len(1)?;
        enc.put_i32(self.partition_id);
        let size_at = enc.begin_length();
        self.messages.encode(enc)?;
        enc.finish_length(size_at);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProducePartitionResponse {
    pub partition_id: i32,
    pub error_code: i16,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
}

impl ProduceResponse {
    pub fn decode(dec: &mut Decoder) -> Result<Self, WireError> {
        let topic_count = dec.get_array_len()?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = required_string(dec)?;
            let partition_count = dec.get_array_len()?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                partitions.push(ProducePartitionResponse {
                    partition_id: dec.get_i32()?,
                    error_code: dec.get_i16()?,
                    offset: dec.get_i64()?,
                });
            }
            topics.push(ProduceTopicResponse { name, partitions });
        }
        Ok(Self { topics })
    }

    /// Finds the response entry for one (topic, partition).
    pub fn partition(&self, topic: &str, partition_id: i32) -> Option<&ProducePartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.partition_id == partition_id)
    }
}

fn required_string(dec: &mut Decoder) -> Result<String, WireError> {
    dec.get_string()?.ok_or(WireError::InvalidLength(-1))
}

fn decode_i32_array(dec: &mut Decoder) -> Result<Vec<i32>, WireError> {
    let count = dec.get_array_len()?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(dec.get_i32()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;
    use bytes::Bytes;

    #[test]
    fn request_header_layout() {
        let header = RequestHeader {
            api_key: api_key::PRODUCE,
            api_version: API_VERSION,
            correlation_id: 7,
            client_id: "cid".to_owned(),
        };
        let mut enc = Encoder::new();
        header.encode(&mut enc).unwrap();

        assert_eq!(
            &enc.into_bytes()[..],
            &[0, 0, 0, 0, 0, 0, 0, 7, 0, 3, b'c', b'i', b'd']
        );
    }

    #[test]
    fn metadata_request_all_topics_is_empty_array() {
        let mut enc = Encoder::new();
        MetadataRequest::default().encode(&mut enc).unwrap();
        assert_eq!(&enc.into_bytes()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn metadata_response_decode() {
        let mut enc = Encoder::new();
        enc.put_array_len(2).unwrap();
        enc.put_i32(1);
        enc.put_string(Some("kafka-1")).unwrap();
        enc.put_i32(9092);
        enc.put_i32(2);
        enc.put_string(Some("kafka-2")).unwrap();
        enc.put_i32(9093);

        enc.put_array_len(1).unwrap();
        enc.put_i16(0);
        enc.put_string(Some("events")).unwrap();
        enc.put_array_len(1).unwrap();
        enc.put_i16(0);
        enc.put_i32(0);
        enc.put_i32(2);
        enc.put_array_len(2).unwrap();
        enc.put_i32(1);
        enc.put_i32(2);
        enc.put_array_len(1).unwrap();
        enc.put_i32(2);

        let mut dec = Decoder::new(enc.into_bytes());
        let response = MetadataResponse::decode(&mut dec).unwrap();
        assert_eq!(dec.remaining(), 0);

        assert_eq!(response.brokers.len(), 2);
        assert_eq!(response.brokers[1].host, "kafka-2");
        assert_eq!(response.topics.len(), 1);
        let partition = &response.topics[0].partitions[0];
        assert_eq!(partition.leader, 2);
        assert_eq!(partition.replicas, vec![1, 2]);
        assert_eq!(partition.isr, vec![2]);
    }

    #[test]
    fn produce_request_layout() {
        let mut set = MessageSet::new(CompressionType::None, 1024);
        set.push(Bytes::from_static(b"v"), None).unwrap();

        let request = ProduceRequest {
            required_acks: -1,
            timeout_ms: 10_000,
            topic: "t",
            partition_id: 5,
            messages: &set,
        };
        let mut enc = Encoder::new();
        request.encode(&mut enc).unwrap();

        let mut dec = Decoder::new(enc.into_bytes());
        assert_eq!(dec.get_i16().unwrap(), -1);
        assert_eq!(dec.get_i32().unwrap(), 10_000);
        assert_eq!(dec.get_array_len().unwrap(), 1);
        assert_eq!(dec.get_string().unwrap().unwrap(), "t");
        assert_eq!(dec.get_array_len().unwrap(), 1);
        assert_eq!(dec.get_i32().unwrap(), 5);
        let set_size = dec.get_i32().unwrap() as usize;
        assert_eq!(dec.remaining(), set_size);
        let decoded = MessageSet::decode(&mut dec).unwrap();
        assert_eq!(decoded, set.messages());
    }

    #[test]
    fn produce_response_decode_and_lookup() {
        let mut enc = Encoder::new();
        enc.put_array_len(1).unwrap();
        enc.put_string(Some("t")).unwrap();
        enc.put_array_len(2).unwrap();
        enc.put_i32(0);
        enc.put_i16(0);
        enc.put_i64(42);
        enc.put_i32(1);
        enc.put_i16(6);
        enc.put_i64(-1);

        let mut dec = Decoder::new(enc.into_bytes());
        let response = ProduceResponse::decode(&mut dec).unwrap();

        let ok = response.partition("t", 0).unwrap();
        assert_eq!(ok.error_code, 0);
        assert_eq!(ok.offset, 42);
        let stale = response.partition("t", 1).unwrap();
        assert_eq!(stale.error_code, 6);
        assert!(response.partition("t", 2).is_none());
        assert!(response.partition("other", 0).is_none());
    }

    #[test]
    fn truncated_metadata_response_fails() {
        let mut enc = Encoder::new();
        enc.put_array_len(1).unwrap();
        enc.put_i32(1);
        // host string missing
        let mut dec = Decoder::new(enc.into_bytes());
        assert!(MetadataResponse::decode(&mut dec).is_err());
    }
}
