//! Message model and physical entry encoding shared by producers and the broker.

pub mod entry;
pub mod message;

pub use entry::{CodecError, CompressionType, ENTRY_MAGIC, EntryCodec};
pub use message::{DecodedMessage, LogicalMessage, MessageId};
pub use sable_storage::Position;
