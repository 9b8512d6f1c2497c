//! Physical entry format.
//!
//! Every entry starts with `magic: u16` and `kind: u8`. All integers are
//! big-endian.
//!
//! ```text
//! single: magic kind=0 crc32(record) record
//! batch:  magic kind=1 compression count uncompressed_size crc32(body) body
//! record: meta_len meta(msgpack) payload_len payload
//! ```
//!
//! `body` is the concatenated records, compressed when `compression` is not
//! `None`. The checksum covers the stored (possibly compressed) body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::message::{DecodedMessage, LogicalMessage, MessageMetadata};

pub const ENTRY_MAGIC: u16 = 0x5AB1;

const KIND_SINGLE: u8 = 0;
const KIND_BATCH: u8 = 1;

const PREFIX_LEN: usize = 2 + 1;
const BATCH_HEADER_LEN: usize = 1 + 4 + 4 + 4;

#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None = 0,
    Snappy = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            other => Err(CodecError::UnknownCompression(other)),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("bad entry magic {0:#06x}")]
    BadMagic(u16),

    #[error("unknown entry kind {0}")]
    UnknownKind(u8),

    #[error("unknown compression type {0}")]
    UnknownCompression(u8),

    #[error("truncated entry while reading {0}")]
    Truncated(&'static str),

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("uncompressed size mismatch: header says {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("batch entry with zero messages")]
    EmptyBatch,

    #[error("record count mismatch: header says {expected}, found {actual}")]
    CountMismatch { expected: u32, actual: u32 },

    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),

    #[error("{what} too large to encode: {len} bytes")]
    TooLarge { what: &'static str, len: usize },

    #[error("metadata decode error: {0}")]
    MetadataDecode(#[from] rmp_serde::decode::Error),

    #[error("metadata encode error: {0}")]
    MetadataEncode(#[from] rmp_serde::encode::Error),

    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),
}

/// Stateless encoder/decoder for physical entries.
pub struct EntryCodec;

impl EntryCodec {
    /// Encode one message without a batch header.
    pub fn encode_single(msg: &LogicalMessage) -> Result<Bytes, CodecError> {
        let mut record = BytesMut::new();
        put_record(&mut record, msg)?;

        let mut out = BytesMut::with_capacity(PREFIX_LEN + 4 + record.len());
        out.put_u16(ENTRY_MAGIC);
        out.put_u8(KIND_SINGLE);
        out.put_u32(crc32fast::hash(&record));
        out.extend_from_slice(&record);
        Ok(out.freeze())
    }

    /// Encode `messages` as one batch entry. Indices follow slice order.
    pub fn encode_batch(
        messages: &[LogicalMessage],
        compression: CompressionType,
    ) -> Result<Bytes, CodecError> {
        if messages.is_empty() {
            return Err(CodecError::EmptyBatch);
        }
        let count = u32_len("batch count", messages.len())?;

        let mut records = BytesMut::new();
        for msg in messages {
            put_record(&mut records, msg)?;
        }
        let uncompressed_size = u32_len("batch body", records.len())?;

        let body: Bytes = match compression {
            CompressionType::None => records.freeze(),
            CompressionType::Snappy => {
                Bytes::from(snap::raw::Encoder::new().compress_vec(&records)?)
            }
        };

        let mut out = BytesMut::with_capacity(PREFIX_LEN + BATCH_HEADER_LEN + body.len());
        out.put_u16(ENTRY_MAGIC);
        out.put_u8(KIND_BATCH);
        out.put_u8(compression as u8);
        out.put_u32(count);
        out.put_u32(uncompressed_size);
        out.put_u32(crc32fast::hash(&body));
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode an entry of either kind. Single entries come back as one
    /// message with index 0 and size 1.
    pub fn decode(mut src: &[u8]) -> Result<Vec<DecodedMessage>, CodecError> {
        need(src, PREFIX_LEN, "entry prefix")?;
        let magic = src.get_u16();
        if magic != ENTRY_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        match src.get_u8() {
            KIND_SINGLE => {
                need(src, 4, "single checksum")?;
                let stored = src.get_u32();
                check_crc(stored, src)?;

                let message = read_record(&mut src)?;
                if src.has_remaining() {
                    return Err(CodecError::TrailingBytes(src.remaining()));
                }
                Ok(vec![DecodedMessage {
                    batch_index: 0,
                    batch_size: 1,
                    message,
                }])
            }
            KIND_BATCH => {
                need(src, BATCH_HEADER_LEN, "batch header")?;
                let compression = CompressionType::try_from(src.get_u8())?;
                let count = src.get_u32();
                let uncompressed_size = src.get_u32() as usize;
                let stored = src.get_u32();
                if count == 0 {
                    return Err(CodecError::EmptyBatch);
                }
                check_crc(stored, src)?;

                let body: Bytes = match compression {
                    CompressionType::None => Bytes::copy_from_slice(src),
                    CompressionType::Snappy => {
                        let len = snap::raw::decompress_len(src)?;
                        if len != uncompressed_size {
                            return Err(CodecError::SizeMismatch {
                                expected: uncompressed_size,
                                actual: len,
                            });
                        }
                        Bytes::from(snap::raw::Decoder::new().decompress_vec(src)?)
                    }
                };
                if body.len() != uncompressed_size {
                    return Err(CodecError::SizeMismatch {
                        expected: uncompressed_size,
                        actual: body.len(),
                    });
                }

                decode_records(body, count)
            }
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

fn decode_records(mut body: Bytes, count: u32) -> Result<Vec<DecodedMessage>, CodecError> {
    // Each record takes at least 8 bytes of length prefixes.
    let mut out = Vec::with_capacity((count as usize).min(body.len() / 8));
    let mut index = 0u32;

    while body.has_remaining() {
        if index == count {
            return Err(CodecError::TrailingBytes(body.remaining()));
        }
        let message = read_record_bytes(&mut body)?;
        out.push(DecodedMessage {
            batch_index: index,
            batch_size: count,
            message,
        });
        index += 1;
    }

    if index != count {
        return Err(CodecError::CountMismatch {
            expected: count,
            actual: index,
        });
    }
    Ok(out)
}

fn put_record(dst: &mut BytesMut, msg: &LogicalMessage) -> Result<(), CodecError> {
    let meta = rmp_serde::to_vec_named(&MessageMetadata::of(msg))?;
    dst.reserve(8 + meta.len() + msg.payload.len());
    dst.put_u32(u32_len("metadata", meta.len())?);
    dst.extend_from_slice(&meta);
    dst.put_u32(u32_len("payload", msg.payload.len())?);
    dst.extend_from_slice(&msg.payload);
    Ok(())
}

fn read_record(src: &mut &[u8]) -> Result<LogicalMessage, CodecError> {
    need(src, 4, "metadata length")?;
    let meta_len = src.get_u32() as usize;
    need(src, meta_len, "metadata")?;
    let meta: MessageMetadata = rmp_serde::from_slice(&src[..meta_len])?;
    src.advance(meta_len);

    need(src, 4, "payload length")?;
    let payload_len = src.get_u32() as usize;
    need(src, payload_len, "payload")?;
    let payload = Bytes::copy_from_slice(&src[..payload_len]);
    src.advance(payload_len);

    Ok(meta.into_message(payload))
}

fn read_record_bytes(src: &mut Bytes) -> Result<LogicalMessage, CodecError> {
    need(src, 4, "metadata length")?;
    let meta_len = src.get_u32() as usize;
    need(src, meta_len, "metadata")?;
    let meta: MessageMetadata = rmp_serde::from_slice(&src[..meta_len])?;
    src.advance(meta_len);

    need(src, 4, "payload length")?;
    let payload_len = src.get_u32() as usize;
    need(src, payload_len, "payload")?;
    let payload = src.split_to(payload_len);

    Ok(meta.into_message(payload))
}

#[inline]
fn need(src: &[u8], n: usize, what: &'static str) -> Result<(), CodecError> {
    if src.len() < n {
        Err(CodecError::Truncated(what))
    } else {
        Ok(())
    }
}

#[inline]
fn check_crc(stored: u32, data: &[u8]) -> Result<(), CodecError> {
    let computed = crc32fast::hash(data);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

#[inline]
fn u32_len(what: &'static str, len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { what, len })
}
