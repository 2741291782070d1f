//! Message sets: the broker's framed unit of records.
//!
//! A [`MessageSet`] is built record by record under a byte budget that must
//! match the broker's `max.message.bytes` for the topic (the broker does not
//! report it in metadata, so the two configurations have to agree). When a
//! compression kind is set the whole record sequence is compressed at encode
//! time and shipped as a single wrapper record whose value is the compressed
//! payload.

use bytes::Bytes;

use crate::codec::{Decoder, Encoder, WireError};
use crate::compression::{self, CompressionType};
use crate::error::ClientError;

/// 0.8 message sets use magic byte 0.
const MAGIC_V0: i8 = 0;

/// Fixed per-record encoding overhead: offset (8), size (4), crc (4),
/// magic (1), attributes (1), key length (4), value length (4).
const RECORD_OVERHEAD: usize = 26;

/// One record: an optional key and a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Offset as encoded on the wire. Producers send 0; decoded sets carry
    /// whatever the broker assigned.
    pub offset: i64,
}

/// An ordered batch of records with a compression kind and a byte budget.
#[derive(Debug, Clone)]
pub struct MessageSet {
    messages: Vec<Message>,
    compression: CompressionType,
    max_message_size: usize,
    encoded_size: usize,
}

impl MessageSet {
    /// Kafka's default `max.message.bytes`.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_000_000;

    pub fn new(compression: CompressionType, max_message_size: usize) -> Self {
        Self {
            messages: Vec::new(),
            compression,
            max_message_size,
            encoded_size: 0,
        }
    }

    /// Appends a record if the set's encoded size stays within budget.
    ///
    /// The check is conservative for compressed sets: the final size is
    /// unknowable before compressing the whole batch, so the worst-case
    /// compressed size plus the wrapper record overhead is assumed. On
    /// refusal the set is unchanged and no later push can succeed either.
    pub fn push(
        &mut self,
        value: impl Into<Bytes>,
        key: Option<Bytes>,
    ) -> Result<(), ClientError> {
        let value = value.into();
        let record_size =
            RECORD_OVERHEAD + key.as_ref().map_or(0, |k| k.len()) + value.len();

        if self.worst_case_encoded_size(self.encoded_size + record_size) > self.max_message_size {
            return Err(ClientError::MessageSetFull);
        }

        self.encoded_size += record_size;
        self.messages.push(Message {
            key,
            value,
            offset: 0,
        });
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Size of the records encoded without compression. This is the value
    /// the budget accounting runs on.
    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }

    fn worst_case_encoded_size(&self, raw: usize) -> usize {
        match self.compression {
            CompressionType::None => raw,
            kind => RECORD_OVERHEAD + compression::max_compressed_len(kind, raw),
        }
    }

    /// Encodes the set onto the wire, compressing and wrapping if a
    /// compression kind is configured.
    pub fn encode(&self, enc: &mut Encoder) -> Result<(), WireError> {
        match self.compression {
            CompressionType::None => {
                for message in &self.messages {
                    encode_record(
                        enc,
                        message.offset,
                        message.key.as_deref(),
                        &message.value,
                        CompressionType::None,
                    )?;
                }
            }
            kind => {
                let mut inner = Encoder::with_capacity(self.encoded_size);
                for message in &self.messages {
                    encode_record(
                        &mut inner,
                        message.offset,
                        message.key.as_deref(),
                        &message.value,
                        CompressionType::None,
                    )?;
                }
                let compressed = compression::compress(kind, &inner.into_bytes())?;
                encode_record(enc, 0, None, &compressed, kind)?;
            }
        }
        Ok(())
    }

    /// Decodes records until the input is exhausted.
    ///
    /// A partial record at the end of the buffer terminates the decode
    /// cleanly (brokers truncate fetched sets at arbitrary byte boundaries);
    /// corrupt records inside the readable region still fail. Compressed
    /// wrapper records are inflated and their nested records appended in
    /// order.
    pub fn decode(dec: &mut Decoder) -> Result<Vec<Message>, WireError> {
        let mut out = Vec::new();
        loop {
            // offset + size prefix
            if dec.remaining() < 12 {
                break;
            }
            let offset = dec.get_i64()?;
            let size = dec.get_i32()?;
            if size < 0 {
                return Err(WireError::InvalidLength(size));
            }
            if dec.remaining() < size as usize {
                // partial trailing record
                break;
            }
            let record = dec.slice(size as usize)?;
            decode_record(record, offset, &mut out)?;
        }
        Ok(out)
    }
}

fn encode_record(
    enc: &mut Encoder,
    offset: i64,
    key: Option<&[u8]>,
    value: &[u8],
    kind: CompressionType,
) -> Result<(), WireError> {
    enc.put_i64(offset);
    let size_at = enc.begin_length();
    let crc_at = enc.begin_crc();
    enc.put_i8(MAGIC_V0);
    enc.put_i8(kind.attribute());
    enc.put_bytes(key)?;
    enc.put_bytes(Some(value))?;
    enc.finish_crc(crc_at);
    enc.finish_length(size_at);
    Ok(())
}

fn decode_record(record: Bytes, offset: i64, out: &mut Vec<Message>) -> Result<(), WireError> {
    let mut dec = Decoder::new(record.clone());
    let carried_crc = dec.get_i32()? as u32;
    let computed_crc = crc32fast::hash(&record[4..]);
    if carried_crc != computed_crc {
        return Err(WireError::CrcMismatch {
            expected: carried_crc,
            computed: computed_crc,
        });
    }

    let magic = dec.get_i8()?;
    if magic != MAGIC_V0 {
        return Err(WireError::UnknownMagic(magic));
    }
    let attributes = dec.get_i8()?;
    let kind = CompressionType::from_attributes(attributes)?;

    let key = dec.get_bytes()?;
    let value = dec.get_bytes()?.unwrap_or_default();

    match kind {
        CompressionType::None => out.push(Message { key, value, offset }),
        kind => {
            let inflated = compression::decompress(kind, &value)?;
            let mut inner = Decoder::new(Bytes::from(inflated));
            out.extend(MessageSet::decode(&mut inner)?);
        }
    }
    Ok(())
}
