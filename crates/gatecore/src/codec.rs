//! Binary layout of the commands partitions send each other to keep
//! message subscriptions in sync.
//!
//! Every command is a fixed header, a fixed-size block and a list of
//! variable-length fields:
//!
//! ```text
//! [schema_id:2][template_id:2][block_length:2][version:2]
//! [fixed block: block_length bytes]
//! ([length:2][bytes])*
//! ```
//!
//! All integers are little endian. Decoders skip fixed fields they do not
//! know about (using `block_length`) and ignore trailing data, so a newer
//! sender can talk to an older receiver.

use crate::error::CodecError;
use crate::key::{decode_partition_id, PartitionId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SCHEMA_ID: u16 = 1;
pub const SCHEMA_VERSION: u16 = 1;
pub const HEADER_LENGTH: usize = 8;

pub const OPEN_MESSAGE_SUBSCRIPTION_TEMPLATE: u16 = 1;
pub const OPEN_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE: u16 = 2;
pub const CORRELATE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE: u16 = 3;
pub const CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE: u16 = 4;
pub const CLOSE_MESSAGE_SUBSCRIPTION_TEMPLATE: u16 = 5;
pub const CLOSE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE: u16 = 6;
pub const REJECT_CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE: u16 = 7;

// partition id, workflow instance key, element instance key
const SUBSCRIPTION_BLOCK: usize = 4 + 8 + 8;
const OPEN_BLOCK: usize = SUBSCRIPTION_BLOCK + 1;
const CORRELATE_BLOCK: usize = SUBSCRIPTION_BLOCK + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub schema_id: u16,
    pub template_id: u16,
    pub block_length: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(buf);
        reader.header()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessageSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub close_on_correlate: bool,
    pub message_name: String,
    pub correlation_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenWorkflowInstanceSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub close_on_correlate: bool,
    pub message_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelateWorkflowInstanceSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_key: i64,
    pub message_name: String,
    pub correlation_key: String,
    /// Message payload as a JSON document.
    pub variables: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelateMessageSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_key: i64,
    pub message_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessageSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseWorkflowInstanceSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectCorrelateMessageSubscription {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_key: i64,
    pub message_name: String,
    pub correlation_key: String,
}

/// A command exchanged between the partition owning a workflow instance and
/// the partition owning the message subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    OpenMessageSubscription(OpenMessageSubscription),
    OpenWorkflowInstanceSubscription(OpenWorkflowInstanceSubscription),
    CorrelateWorkflowInstanceSubscription(CorrelateWorkflowInstanceSubscription),
    CorrelateMessageSubscription(CorrelateMessageSubscription),
    CloseMessageSubscription(CloseMessageSubscription),
    CloseWorkflowInstanceSubscription(CloseWorkflowInstanceSubscription),
    RejectCorrelateMessageSubscription(RejectCorrelateMessageSubscription),
}

impl SubscriptionCommand {
    pub fn template_id(&self) -> u16 {
        match self {
            SubscriptionCommand::OpenMessageSubscription(_) => OPEN_MESSAGE_SUBSCRIPTION_TEMPLATE,
            SubscriptionCommand::OpenWorkflowInstanceSubscription(_) => {
                OPEN_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE
            }
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_) => {
                CORRELATE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE
            }
            SubscriptionCommand::CorrelateMessageSubscription(_) => {
                CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE
            }
            SubscriptionCommand::CloseMessageSubscription(_) => CLOSE_MESSAGE_SUBSCRIPTION_TEMPLATE,
            SubscriptionCommand::CloseWorkflowInstanceSubscription(_) => {
                CLOSE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE
            }
            SubscriptionCommand::RejectCorrelateMessageSubscription(_) => {
                REJECT_CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE
            }
        }
    }

    fn block_length(&self) -> usize {
        match self {
            SubscriptionCommand::OpenMessageSubscription(_)
            | SubscriptionCommand::OpenWorkflowInstanceSubscription(_) => OPEN_BLOCK,
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_)
            | SubscriptionCommand::CorrelateMessageSubscription(_)
            | SubscriptionCommand::RejectCorrelateMessageSubscription(_) => CORRELATE_BLOCK,
            SubscriptionCommand::CloseMessageSubscription(_)
            | SubscriptionCommand::CloseWorkflowInstanceSubscription(_) => SUBSCRIPTION_BLOCK,
        }
    }

    /// Partition the command has to be delivered to.
    ///
    /// Message subscription commands go to the partition owning the
    /// correlation key, instance subscription commands to the partition
    /// owning the workflow instance.
    pub fn target_partition(&self) -> PartitionId {
        match self {
            SubscriptionCommand::OpenMessageSubscription(c) => c.subscription_partition_id,
            SubscriptionCommand::CorrelateMessageSubscription(c) => c.subscription_partition_id,
            SubscriptionCommand::CloseMessageSubscription(c) => c.subscription_partition_id,
            SubscriptionCommand::RejectCorrelateMessageSubscription(c) => {
                c.subscription_partition_id
            }
            SubscriptionCommand::OpenWorkflowInstanceSubscription(c) => {
                decode_partition_id(c.workflow_instance_key)
            }
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription(c) => {
                decode_partition_id(c.workflow_instance_key)
            }
            SubscriptionCommand::CloseWorkflowInstanceSubscription(c) => {
                decode_partition_id(c.workflow_instance_key)
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.block_length() + 64);
        buf.put_u16_le(SCHEMA_ID);
        buf.put_u16_le(self.template_id());
        buf.put_u16_le(self.block_length() as u16);
        buf.put_u16_le(SCHEMA_VERSION);

        match self {
            SubscriptionCommand::OpenMessageSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                buf.put_u8(c.close_on_correlate as u8);
                put_var(&mut buf, c.message_name.as_bytes())?;
                put_var(&mut buf, c.correlation_key.as_bytes())?;
            }
            SubscriptionCommand::OpenWorkflowInstanceSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                buf.put_u8(c.close_on_correlate as u8);
                put_var(&mut buf, c.message_name.as_bytes())?;
            }
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                buf.put_i64_le(c.message_key);
                put_var(&mut buf, c.message_name.as_bytes())?;
                put_var(&mut buf, c.correlation_key.as_bytes())?;
                put_var(&mut buf, &c.variables)?;
            }
            SubscriptionCommand::CorrelateMessageSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                buf.put_i64_le(c.message_key);
                put_var(&mut buf, c.message_name.as_bytes())?;
            }
            SubscriptionCommand::CloseMessageSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                put_var(&mut buf, c.message_name.as_bytes())?;
            }
            SubscriptionCommand::CloseWorkflowInstanceSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                put_var(&mut buf, c.message_name.as_bytes())?;
            }
            SubscriptionCommand::RejectCorrelateMessageSubscription(c) => {
                put_subscription(
                    &mut buf,
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                );
                buf.put_i64_le(c.message_key);
                put_var(&mut buf, c.message_name.as_bytes())?;
                put_var(&mut buf, c.correlation_key.as_bytes())?;
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(buf);
        let header = reader.header()?;

        if header.schema_id != SCHEMA_ID {
            return Err(CodecError::UnknownSchema(header.schema_id));
        }

        let expected_block = match header.template_id {
            OPEN_MESSAGE_SUBSCRIPTION_TEMPLATE | OPEN_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE => {
                OPEN_BLOCK
            }
            CORRELATE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE
            | CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE
            | REJECT_CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE => CORRELATE_BLOCK,
            CLOSE_MESSAGE_SUBSCRIPTION_TEMPLATE | CLOSE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE => {
                SUBSCRIPTION_BLOCK
            }
            other => return Err(CodecError::UnknownTemplate(other)),
        };

        let block_length = header.block_length as usize;
        if block_length < expected_block {
            return Err(CodecError::BufferTooShort {
                needed: expected_block,
                remaining: block_length,
            });
        }

        let mut block = Reader::new(reader.take(block_length)?);
        let subscription_partition_id = block.u32()?;
        let workflow_instance_key = block.i64()?;
        let element_instance_key = block.i64()?;

        let command = match header.template_id {
            OPEN_MESSAGE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::OpenMessageSubscription(OpenMessageSubscription {
                    subscription_partition_id,
                    workflow_instance_key,
                    element_instance_key,
                    close_on_correlate: block.u8()? != 0,
                    message_name: reader.string()?,
                    correlation_key: reader.string()?,
                })
            }
            OPEN_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::OpenWorkflowInstanceSubscription(
                    OpenWorkflowInstanceSubscription {
                        subscription_partition_id,
                        workflow_instance_key,
                        element_instance_key,
                        close_on_correlate: block.u8()? != 0,
                        message_name: reader.string()?,
                    },
                )
            }
            CORRELATE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::CorrelateWorkflowInstanceSubscription(
                    CorrelateWorkflowInstanceSubscription {
                        subscription_partition_id,
                        workflow_instance_key,
                        element_instance_key,
                        message_key: block.i64()?,
                        message_name: reader.string()?,
                        correlation_key: reader.string()?,
                        variables: Bytes::copy_from_slice(reader.var()?),
                    },
                )
            }
            CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::CorrelateMessageSubscription(CorrelateMessageSubscription {
                    subscription_partition_id,
                    workflow_instance_key,
                    element_instance_key,
                    message_key: block.i64()?,
                    message_name: reader.string()?,
                })
            }
            CLOSE_MESSAGE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::CloseMessageSubscription(CloseMessageSubscription {
                    subscription_partition_id,
                    workflow_instance_key,
                    element_instance_key,
                    message_name: reader.string()?,
                })
            }
            CLOSE_WORKFLOW_INSTANCE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::CloseWorkflowInstanceSubscription(
                    CloseWorkflowInstanceSubscription {
                        subscription_partition_id,
                        workflow_instance_key,
                        element_instance_key,
                        message_name: reader.string()?,
                    },
                )
            }
            REJECT_CORRELATE_MESSAGE_SUBSCRIPTION_TEMPLATE => {
                SubscriptionCommand::RejectCorrelateMessageSubscription(
                    RejectCorrelateMessageSubscription {
                        subscription_partition_id,
                        workflow_instance_key,
                        element_instance_key,
                        message_key: block.i64()?,
                        message_name: reader.string()?,
                        correlation_key: reader.string()?,
                    },
                )
            }
            other => return Err(CodecError::UnknownTemplate(other)),
        };

        Ok(command)
    }
}

fn put_subscription(
    buf: &mut BytesMut,
    subscription_partition_id: PartitionId,
    workflow_instance_key: i64,
    element_instance_key: i64,
) {
    buf.put_u32_le(subscription_partition_id);
    buf.put_i64_le(workflow_instance_key);
    buf.put_i64_le(element_instance_key);
}

fn put_var(buf: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let length = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong(value.len()))?;
    buf.put_u16_le(length);
    buf.put_slice(value);
    Ok(())
}

/// Bounds-checked cursor; every read fails instead of panicking on a
/// short buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::BufferTooShort {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn header(&mut self) -> Result<MessageHeader, CodecError> {
        self.ensure(HEADER_LENGTH)?;
        Ok(MessageHeader {
            schema_id: self.buf.get_u16_le(),
            template_id: self.buf.get_u16_le(),
            block_length: self.buf.get_u16_le(),
            version: self.buf.get_u16_le(),
        })
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8], CodecError> {
        self.ensure(length)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(length);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn var(&mut self) -> Result<&'a [u8], CodecError> {
        let length = self.u16()? as usize;
        self.take(length)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.var()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}
