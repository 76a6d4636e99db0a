//! Core types for the gateflow engine
//!
//! This crate provides partition-aware keys, process definitions, log
//! records and the wire codec for subscription commands. It has no
//! runtime; the engine itself lives in `gateruntime`.

pub mod codec;
mod definition;
mod error;
mod events;
mod key;
pub mod record;
mod value;

pub use definition::{
    CatchEventDefinition, MappingKind, NodeKind, NodeSpec, PayloadMapping, ProcessDefinition,
    SequenceFlow,
};
pub use error::{CodecError, DefinitionError, ExpressionError, GateError};
pub use events::RecordBus;
pub use key::{
    decode_local_key, decode_partition_id, encode_partition_id, subscription_partition_id,
    KeyGenerator, PartitionId, KEY_BITS, START_PARTITION_ID,
};
pub use record::{Intent, Record, RecordType, RecordValue, RejectionType};
pub use value::{variables_from_json, Value, Variables};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, GateError>;
