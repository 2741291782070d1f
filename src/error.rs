//! Error types for the kafsink client

use std::io;

use crate::codec::WireError;

/// Unified error type surfaced by every public client call.
///
/// Transport problems collapse into [`ClientError::NetworkFail`] /
/// [`ClientError::NetworkTimeout`] so callers can cheaply distinguish "the
/// broker said no" from "we never heard back". Protocol error codes returned
/// by a broker are preserved verbatim in [`ClientError::Broker`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Deadline elapsed while connecting or awaiting a response.
    #[error("operation timed out")]
    NetworkTimeout,

    /// Transport-level failure: connect refused, DNS resolve failure, the
    /// connection was closed, or an I/O error mid-request.
    #[error("network failure: {message}")]
    NetworkFail { message: String },

    /// Local encode/decode failure (oversized field, CRC mismatch on read,
    /// malformed response bytes).
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// Adding the record would push the encoded message set past the
    /// configured maximum message size. The set is unchanged.
    #[error("message set is full")]
    MessageSetFull,

    /// The client has been closed and cannot be used again.
    #[error("client is shut down")]
    ClientStopping,

    /// Invalid configuration or arguments.
    #[error("invalid configuration: {message}")]
    BadConfig { message: String },

    /// The broker answered the request with a protocol error code.
    #[error("broker error code {}: {}", .0.code(), .0)]
    Broker(BrokerErrorCode),
}

impl ClientError {
    pub fn network_fail<S: Into<String>>(message: S) -> Self {
        Self::NetworkFail {
            message: message.into(),
        }
    }

    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    pub fn bad_config<S: Into<String>>(message: S) -> Self {
        Self::BadConfig {
            message: message.into(),
        }
    }

    /// True when retrying the same call may succeed, possibly after the
    /// metadata cache has been refreshed. The client never retries on the
    /// caller's behalf; this is a hint for the caller's retry policy.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::NetworkTimeout | Self::NetworkFail { .. } => true,
            Self::Broker(code) => code.is_retriable(),
            _ => false,
        }
    }

    /// True when this error indicates the cached leader mapping was stale.
    pub fn is_stale_metadata(&self) -> bool {
        matches!(self, Self::Broker(code) if code.invalidates_metadata())
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::NetworkTimeout
        } else {
            Self::NetworkFail {
                message: err.to_string(),
            }
        }
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        Self::Encoding {
            message: err.to_string(),
        }
    }
}

/// Protocol error codes a 0.8 broker can return, by their wire value.
///
/// Codes the client does not know by name are preserved in [`Other`] so the
/// numeric value always survives to the caller.
///
/// [`Other`]: BrokerErrorCode::Other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    /// An unexpected server error (wire code -1).
    Unknown,
    /// The requested offset is outside the range held for the partition.
    OffsetOutOfRange,
    /// Message contents do not match the CRC the broker computed.
    InvalidMessage,
    /// The topic or partition does not exist on this broker.
    UnknownTopicOrPartition,
    /// The message has a negative size.
    InvalidMessageSize,
    /// A leadership election is in progress and the partition has no leader.
    LeaderNotAvailable,
    /// The request was sent to a replica that is not the leader; the
    /// client's metadata is out of date.
    NotLeaderForPartition,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut,
    /// Used mostly by tools when a broker is not alive.
    BrokerNotAvailable,
    /// A replica was expected on a broker but is not there.
    ReplicaNotAvailable,
    /// The message exceeds the broker's configured maximum size.
    MessageSizeTooLarge,
    /// Internal broker-to-broker error code.
    StaleControllerEpoch,
    /// Offset metadata string exceeded the configured maximum.
    OffsetMetadataTooLarge,
    /// The broker is still loading offsets after a leader change.
    OffsetsLoadInProgress,
    /// The offsets topic has not been created yet.
    ConsumerCoordinatorNotAvailable,
    /// The broker is not the coordinator for the consumer group.
    NotCoordinatorForConsumer,
    /// A code this client has no name for.
    Other(i16),
}

impl BrokerErrorCode {
    /// Maps a wire error code to its named variant. Code 0 means success
    /// and has no error value, hence `None`.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => None,
            -1 => Some(Self::Unknown),
            1 => Some(Self::OffsetOutOfRange),
            2 => Some(Self::InvalidMessage),
            3 => Some(Self::UnknownTopicOrPartition),
            4 => Some(Self::InvalidMessageSize),
            5 => Some(Self::LeaderNotAvailable),
            6 => Some(Self::NotLeaderForPartition),
            7 => Some(Self::RequestTimedOut),
            8 => Some(Self::BrokerNotAvailable),
            9 => Some(Self::ReplicaNotAvailable),
            10 => Some(Self::MessageSizeTooLarge),
            11 => Some(Self::StaleControllerEpoch),
            12 => Some(Self::OffsetMetadataTooLarge),
            14 => Some(Self::OffsetsLoadInProgress),
            15 => Some(Self::ConsumerCoordinatorNotAvailable),
            16 => Some(Self::NotCoordinatorForConsumer),
            other => Some(Self::Other(other)),
        }
    }

    /// The numeric wire value of this code.
    pub fn code(&self) -> i16 {
        match self {
            Self::Unknown => -1,
            Self::OffsetOutOfRange => 1,
            Self::InvalidMessage => 2,
            Self::UnknownTopicOrPartition => 3,
            Self::InvalidMessageSize => 4,
            Self::LeaderNotAvailable => 5,
            Self::NotLeaderForPartition => 6,
            Self::RequestTimedOut => 7,
            Self::BrokerNotAvailable => 8,
            Self::ReplicaNotAvailable => 9,
            Self::MessageSizeTooLarge => 10,
            Self::StaleControllerEpoch => 11,
            Self::OffsetMetadataTooLarge => 12,
            Self::OffsetsLoadInProgress => 14,
            Self::ConsumerCoordinatorNotAvailable => 15,
            Self::NotCoordinatorForConsumer => 16,
            Self::Other(code) => *code,
        }
    }

    /// Codes that mean the cached leader mapping is stale and must be
    /// refreshed before the partition can be produced to again.
    pub fn invalidates_metadata(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition | Self::LeaderNotAvailable | Self::NotLeaderForPartition
        )
    }

    /// Codes where a retry (after a metadata refresh where applicable) can
    /// reasonably be expected to succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::LeaderNotAvailable
                | Self::NotLeaderForPartition
                | Self::RequestTimedOut
                | Self::BrokerNotAvailable
                | Self::OffsetsLoadInProgress
        )
    }
}

impl std::fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::Unknown => "unexpected server error",
            Self::OffsetOutOfRange => "requested offset is out of range",
            Self::InvalidMessage => "message contents do not match its CRC",
            Self::UnknownTopicOrPartition => "unknown topic or partition",
            Self::InvalidMessageSize => "message has a negative size",
            Self::LeaderNotAvailable => "partition has no leader (election in progress)",
            Self::NotLeaderForPartition => "broker is not the leader for the partition",
            Self::RequestTimedOut => "request exceeded its time limit on the broker",
            Self::BrokerNotAvailable => "broker not available",
            Self::ReplicaNotAvailable => "expected replica not available",
            Self::MessageSizeTooLarge => "message larger than the broker's configured maximum",
            Self::StaleControllerEpoch => "stale controller epoch",
            Self::OffsetMetadataTooLarge => "offset metadata string too large",
            Self::OffsetsLoadInProgress => "broker is still loading offsets",
            Self::ConsumerCoordinatorNotAvailable => "consumer coordinator not available",
            Self::NotCoordinatorForConsumer => "broker is not the coordinator for this consumer",
            Self::Other(_) => "unrecognized broker error code",
        };
        f.write_str(message)
    }
}
