use crate::key::PartitionId;
use crate::record::RejectionType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Partition {0} is not available")]
    PartitionUnavailable(PartitionId),

    #[error("Command rejected ({rejection_type:?}): {reason}")]
    Rejected {
        rejection_type: RejectionType,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Unknown element: {0}")]
    UnknownElement(String),

    #[error("Element not reachable from the start event: {0}")]
    Unreachable(String),

    #[error("Invalid process: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Buffer too short: needed {needed} bytes, {remaining} remaining")]
    BufferTooShort { needed: usize, remaining: usize },

    #[error("Unknown schema id {0}")]
    UnknownSchema(u16),

    #[error("Unknown template id {0}")]
    UnknownTemplate(u16),

    #[error("Field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Field of {0} bytes exceeds the length prefix")]
    FieldTooLong(usize),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Failed to evaluate '{expression}': {message}")]
    Evaluation { expression: String, message: String },

    #[error("Expected a boolean from '{0}'")]
    NotBoolean(String),

    #[error("Unsupported value from '{0}'")]
    UnsupportedValue(String),
}
