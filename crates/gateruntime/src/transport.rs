//! Delivery of subscription commands between partitions.
//!
//! Sending is fire-and-forget: a `false` from [`PartitionTransport::send`]
//! or a command lost on the way is repaired by the sender's pending sweep,
//! and receivers treat every command as possibly duplicated.

use dashmap::DashMap;
use gatecore::codec::{
    CloseMessageSubscription, CloseWorkflowInstanceSubscription,
    CorrelateMessageSubscription, CorrelateWorkflowInstanceSubscription,
    OpenMessageSubscription, OpenWorkflowInstanceSubscription,
    RejectCorrelateMessageSubscription, SubscriptionCommand,
};
use gatecore::record::{
    MessageSubscriptionIntent, MessageSubscriptionRecord, WorkflowInstanceSubscriptionIntent,
    WorkflowInstanceSubscriptionRecord,
};
use gatecore::{CodecError, PartitionId, Record, Variables};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Moves encoded commands to the partition they are addressed to.
pub trait PartitionTransport: Send + Sync {
    /// Hand `payload` over for delivery. `false` means it was not accepted.
    fn send(&self, partition_id: PartitionId, payload: Bytes) -> bool;
}

/// In-process transport over bounded channels, one per partition.
#[derive(Default)]
pub struct ChannelTransport {
    partitions: DashMap<PartitionId, mpsc::Sender<Bytes>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition_id: PartitionId, inbound: mpsc::Sender<Bytes>) {
        self.partitions.insert(partition_id, inbound);
    }

    pub fn unregister(&self, partition_id: PartitionId) {
        self.partitions.remove(&partition_id);
    }
}

impl PartitionTransport for ChannelTransport {
    fn send(&self, partition_id: PartitionId, payload: Bytes) -> bool {
        let Some(inbound) = self.partitions.get(&partition_id) else {
            debug!(partition_id, "No route to partition");
            return false;
        };
        match inbound.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(partition_id, error = %e, "Partition did not accept command");
                false
            }
        }
    }
}

pub(crate) fn encode_variables(variables: &Variables) -> Bytes {
    serde_json::to_vec(variables)
        .map(Bytes::from)
        .unwrap_or_default()
}

/// Encodes subscription commands and routes them by their target partition.
#[derive(Clone)]
pub struct SubscriptionCommandSender {
    transport: Arc<dyn PartitionTransport>,
}

impl SubscriptionCommandSender {
    pub fn new(transport: Arc<dyn PartitionTransport>) -> Self {
        Self { transport }
    }

    pub fn send(&self, command: &SubscriptionCommand) -> bool {
        let partition_id = command.target_partition();
        match command.encode() {
            Ok(payload) => self.transport.send(partition_id, payload),
            Err(e) => {
                warn!(partition_id, error = %e, "Failed to encode subscription command");
                false
            }
        }
    }

    pub fn open_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_name: &str,
        correlation_key: &str,
        close_on_correlate: bool,
    ) -> bool {
        self.send(&SubscriptionCommand::OpenMessageSubscription(
            OpenMessageSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                close_on_correlate,
                message_name: message_name.to_string(),
                correlation_key: correlation_key.to_string(),
            },
        ))
    }

    pub fn open_workflow_instance_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_name: &str,
        close_on_correlate: bool,
    ) -> bool {
        self.send(&SubscriptionCommand::OpenWorkflowInstanceSubscription(
            OpenWorkflowInstanceSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                close_on_correlate,
                message_name: message_name.to_string(),
            },
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn correlate_workflow_instance_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_key: i64,
        message_name: &str,
        correlation_key: &str,
        variables: &Variables,
    ) -> bool {
        self.send(&SubscriptionCommand::CorrelateWorkflowInstanceSubscription(
            CorrelateWorkflowInstanceSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                message_key,
                message_name: message_name.to_string(),
                correlation_key: correlation_key.to_string(),
                variables: encode_variables(variables),
            },
        ))
    }

    pub fn correlate_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_key: i64,
        message_name: &str,
    ) -> bool {
        self.send(&SubscriptionCommand::CorrelateMessageSubscription(
            CorrelateMessageSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                message_key,
                message_name: message_name.to_string(),
            },
        ))
    }

    pub fn close_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_name: &str,
    ) -> bool {
        self.send(&SubscriptionCommand::CloseMessageSubscription(
            CloseMessageSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                message_name: message_name.to_string(),
            },
        ))
    }

    pub fn close_workflow_instance_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_name: &str,
    ) -> bool {
        self.send(&SubscriptionCommand::CloseWorkflowInstanceSubscription(
            CloseWorkflowInstanceSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                message_name: message_name.to_string(),
            },
        ))
    }

    pub fn reject_correlate_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        workflow_instance_key: i64,
        element_instance_key: i64,
        message_key: i64,
        message_name: &str,
        correlation_key: &str,
    ) -> bool {
        self.send(&SubscriptionCommand::RejectCorrelateMessageSubscription(
            RejectCorrelateMessageSubscription {
                subscription_partition_id,
                workflow_instance_key,
                element_instance_key,
                message_key,
                message_name: message_name.to_string(),
                correlation_key: correlation_key.to_string(),
            },
        ))
    }
}

/// Turns received bytes into a command record for the local partition.
pub struct SubscriptionCommandHandler;

impl SubscriptionCommandHandler {
    /// `None` for anything that is not a command this partition understands.
    pub fn handle(payload: &[u8]) -> Option<Record> {
        let command = match SubscriptionCommand::decode(payload) {
            Ok(command) => command,
            Err(e @ (CodecError::UnknownSchema(_) | CodecError::UnknownTemplate(_))) => {
                debug!(error = %e, "Ignoring unknown subscription command");
                return None;
            }
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "Dropping malformed subscription command");
                return None;
            }
        };
        Self::to_record(command)
    }

    fn to_record(command: SubscriptionCommand) -> Option<Record> {
        let record = match command {
            SubscriptionCommand::OpenMessageSubscription(c) => Record::command(
                -1,
                MessageSubscriptionIntent::Open,
                MessageSubscriptionRecord {
                    workflow_instance_key: c.workflow_instance_key,
                    element_instance_key: c.element_instance_key,
                    message_name: c.message_name,
                    correlation_key: c.correlation_key,
                    message_key: -1,
                    close_on_correlate: c.close_on_correlate,
                    variables: Variables::new(),
                },
            ),
            SubscriptionCommand::OpenWorkflowInstanceSubscription(c) => Record::command(
                -1,
                WorkflowInstanceSubscriptionIntent::Open,
                instance_subscription(
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    c.close_on_correlate,
                ),
            ),
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription(c) => {
                let variables = if c.variables.is_empty() {
                    Variables::new()
                } else {
                    match serde_json::from_slice(&c.variables) {
                        Ok(variables) => variables,
                        Err(e) => {
                            warn!(
                                message_key = c.message_key,
                                error = %e,
                                "Dropping correlation with malformed variables"
                            );
                            return None;
                        }
                    }
                };
                let mut value = instance_subscription(
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    true,
                );
                value.correlation_key = c.correlation_key;
                value.message_key = c.message_key;
                value.variables = variables;
                Record::command(-1, WorkflowInstanceSubscriptionIntent::Correlate, value)
            }
            SubscriptionCommand::CorrelateMessageSubscription(c) => Record::command(
                -1,
                MessageSubscriptionIntent::Correlate,
                message_subscription(
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    String::new(),
                    c.message_key,
                ),
            ),
            SubscriptionCommand::CloseMessageSubscription(c) => Record::command(
                -1,
                MessageSubscriptionIntent::Close,
                message_subscription(
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    String::new(),
                    -1,
                ),
            ),
            SubscriptionCommand::CloseWorkflowInstanceSubscription(c) => Record::command(
                -1,
                WorkflowInstanceSubscriptionIntent::Close,
                instance_subscription(
                    c.subscription_partition_id,
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    true,
                ),
            ),
            SubscriptionCommand::RejectCorrelateMessageSubscription(c) => Record::command(
                -1,
                MessageSubscriptionIntent::Reject,
                message_subscription(
                    c.workflow_instance_key,
                    c.element_instance_key,
                    c.message_name,
                    c.correlation_key,
                    c.message_key,
                ),
            ),
        };
        Some(record)
    }
}

fn message_subscription(
    workflow_instance_key: i64,
    element_instance_key: i64,
    message_name: String,
    correlation_key: String,
    message_key: i64,
) -> MessageSubscriptionRecord {
    MessageSubscriptionRecord {
        workflow_instance_key,
        element_instance_key,
        message_name,
        correlation_key,
        message_key,
        close_on_correlate: true,
        variables: Variables::new(),
    }
}

fn instance_subscription(
    subscription_partition_id: PartitionId,
    workflow_instance_key: i64,
    element_instance_key: i64,
    message_name: String,
    close_on_correlate: bool,
) -> WorkflowInstanceSubscriptionRecord {
    WorkflowInstanceSubscriptionRecord {
        subscription_partition_id,
        workflow_instance_key,
        element_instance_key,
        message_name,
        correlation_key: String::new(),
        message_key: -1,
        close_on_correlate,
        variables: Variables::new(),
        handler_element_id: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatecore::codec::SCHEMA_ID;
    use gatecore::{encode_partition_id, Intent, Value};

    #[test]
    fn channel_transport_reports_unroutable_and_full_partitions() {
        let transport = ChannelTransport::new();
        assert!(!transport.send(1, Bytes::from_static(b"x")));

        let (tx, mut rx) = mpsc::channel(1);
        transport.register(1, tx);
        assert!(transport.send(1, Bytes::from_static(b"a")));
        assert!(!transport.send(1, Bytes::from_static(b"b")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));

        transport.unregister(1);
        assert!(!transport.send(1, Bytes::from_static(b"c")));
    }

    #[test]
    fn sender_routes_by_target_partition() {
        let transport = Arc::new(ChannelTransport::new());
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        transport.register(1, tx1);
        transport.register(2, tx2);

        let sender = SubscriptionCommandSender::new(transport);
        let workflow_instance_key = encode_partition_id(1, 10);
        assert!(sender.open_message_subscription(
            2,
            workflow_instance_key,
            11,
            "order",
            "id-1",
            true
        ));
        assert!(sender.open_workflow_instance_subscription(
            2,
            workflow_instance_key,
            11,
            "order",
            true
        ));

        let open = SubscriptionCommandHandler::handle(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(open.intent, Intent::MessageSubscription(MessageSubscriptionIntent::Open));
        assert_eq!(open.message_subscription().unwrap().correlation_key, "id-1");

        let ack = SubscriptionCommandHandler::handle(&rx1.try_recv().unwrap()).unwrap();
        assert_eq!(
            ack.intent,
            Intent::WorkflowInstanceSubscription(WorkflowInstanceSubscriptionIntent::Open)
        );
        assert_eq!(ack.workflow_instance_subscription().unwrap().subscription_partition_id, 2);
    }

    #[test]
    fn correlation_carries_variables() {
        let transport = Arc::new(ChannelTransport::new());
        let (tx, mut rx) = mpsc::channel(8);
        transport.register(1, tx);

        let mut variables = Variables::new();
        variables.insert("total".into(), Value::Number(42.0));
        let sender = SubscriptionCommandSender::new(transport);
        assert!(sender.correlate_workflow_instance_subscription(
            3,
            encode_partition_id(1, 5),
            6,
            encode_partition_id(3, 7),
            "paid",
            "id-1",
            &variables,
        ));

        let record = SubscriptionCommandHandler::handle(&rx.try_recv().unwrap()).unwrap();
        let value = record.workflow_instance_subscription().unwrap();
        assert_eq!(value.message_key, encode_partition_id(3, 7));
        assert_eq!(value.variables, variables);
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&SCHEMA_ID.to_le_bytes());
        payload.extend_from_slice(&99u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());

        assert!(SubscriptionCommandHandler::handle(&payload).is_none());
        assert!(SubscriptionCommandHandler::handle(&[1, 2, 3]).is_none());
    }
}
