//! Log records.
//!
//! Everything a partition does is written to its log as a [`Record`]:
//! commands ask for something to happen, events state that it happened and
//! rejections explain why a command had no effect. Replaying the events of a
//! log rebuilds the partition state.

use crate::definition::NodeKind;
use crate::key::PartitionId;
use crate::value::Variables;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    InvalidState,
    NotFound,
    AlreadyExists,
    InvalidArgument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceIntent {
    Create,
    Cancel,
    ElementActivating,
    ElementActivated,
    GatewayActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    SequenceFlowTaken,
    CatchEventTriggering,
    CatchEventTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSubscriptionIntent {
    Open,
    Opened,
    Correlate,
    Correlating,
    Correlated,
    Close,
    Closed,
    Reject,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceSubscriptionIntent {
    Open,
    Opening,
    Opened,
    Correlate,
    Correlated,
    Close,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageIntent {
    Publish,
    Published,
    Expire,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerIntent {
    Created,
    Trigger,
    Triggered,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentIntent {
    Created,
    Resolve,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    WorkflowInstance(WorkflowInstanceIntent),
    MessageSubscription(MessageSubscriptionIntent),
    WorkflowInstanceSubscription(WorkflowInstanceSubscriptionIntent),
    Message(MessageIntent),
    Timer(TimerIntent),
    Incident(IncidentIntent),
}

impl From<WorkflowInstanceIntent> for Intent {
    fn from(intent: WorkflowInstanceIntent) -> Self {
        Intent::WorkflowInstance(intent)
    }
}

impl From<MessageSubscriptionIntent> for Intent {
    fn from(intent: MessageSubscriptionIntent) -> Self {
        Intent::MessageSubscription(intent)
    }
}

impl From<WorkflowInstanceSubscriptionIntent> for Intent {
    fn from(intent: WorkflowInstanceSubscriptionIntent) -> Self {
        Intent::WorkflowInstanceSubscription(intent)
    }
}

impl From<MessageIntent> for Intent {
    fn from(intent: MessageIntent) -> Self {
        Intent::Message(intent)
    }
}

impl From<TimerIntent> for Intent {
    fn from(intent: TimerIntent) -> Self {
        Intent::Timer(intent)
    }
}

impl From<IncidentIntent> for Intent {
    fn from(intent: IncidentIntent) -> Self {
        Intent::Incident(intent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BpmnElementType {
    Process,
    StartEvent,
    EndEvent,
    Task,
    ExclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
    SequenceFlow,
}

impl From<NodeKind> for BpmnElementType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Start => BpmnElementType::StartEvent,
            NodeKind::End => BpmnElementType::EndEvent,
            NodeKind::Task => BpmnElementType::Task,
            NodeKind::ExclusiveGateway => BpmnElementType::ExclusiveGateway,
            NodeKind::ParallelGateway => BpmnElementType::ParallelGateway,
            NodeKind::EventBasedGateway => BpmnElementType::EventBasedGateway,
            NodeKind::IntermediateCatchEvent => BpmnElementType::IntermediateCatchEvent,
        }
    }
}

impl BpmnElementType {
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            BpmnElementType::ExclusiveGateway
                | BpmnElementType::ParallelGateway
                | BpmnElementType::EventBasedGateway
        )
    }
}

fn no_key() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceRecord {
    pub bpmn_process_id: String,
    pub workflow_instance_key: i64,
    /// Key of the enclosing scope, `-1` for the process itself.
    pub flow_scope_key: i64,
    pub element_id: String,
    pub element_type: BpmnElementType,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
    /// Sequence flows whose queued arrivals an activation consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumed_flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_element_id: Option<String>,
}

impl WorkflowInstanceRecord {
    pub fn new(
        bpmn_process_id: impl Into<String>,
        workflow_instance_key: i64,
        flow_scope_key: i64,
        element_id: impl Into<String>,
        element_type: BpmnElementType,
    ) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            workflow_instance_key,
            flow_scope_key,
            element_id: element_id.into(),
            element_type,
            variables: Variables::new(),
            target_element_id: None,
            consumed_flows: Vec::new(),
            handler_element_id: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSubscriptionRecord {
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_name: String,
    #[serde(default)]
    pub correlation_key: String,
    #[serde(default = "no_key")]
    pub message_key: i64,
    #[serde(default)]
    pub close_on_correlate: bool,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceSubscriptionRecord {
    pub subscription_partition_id: PartitionId,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub message_name: String,
    #[serde(default)]
    pub correlation_key: String,
    #[serde(default = "no_key")]
    pub message_key: i64,
    #[serde(default)]
    pub close_on_correlate: bool,
    #[serde(default)]
    pub variables: Variables,
    /// Catch event the subscription was opened for.
    #[serde(default)]
    pub handler_element_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub name: String,
    pub correlation_key: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub time_to_live_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub deadline: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub handler_element_id: String,
    pub due_date: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ConditionError,
    ExtractValueError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub error_type: ErrorType,
    pub error_message: String,
    pub bpmn_process_id: String,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub element_id: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    WorkflowInstance(WorkflowInstanceRecord),
    MessageSubscription(MessageSubscriptionRecord),
    WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    Message(MessageRecord),
    Timer(TimerRecord),
    Incident(IncidentRecord),
}

impl From<WorkflowInstanceRecord> for RecordValue {
    fn from(value: WorkflowInstanceRecord) -> Self {
        RecordValue::WorkflowInstance(value)
    }
}

impl From<MessageSubscriptionRecord> for RecordValue {
    fn from(value: MessageSubscriptionRecord) -> Self {
        RecordValue::MessageSubscription(value)
    }
}

impl From<WorkflowInstanceSubscriptionRecord> for RecordValue {
    fn from(value: WorkflowInstanceSubscriptionRecord) -> Self {
        RecordValue::WorkflowInstanceSubscription(value)
    }
}

impl From<MessageRecord> for RecordValue {
    fn from(value: MessageRecord) -> Self {
        RecordValue::Message(value)
    }
}

impl From<TimerRecord> for RecordValue {
    fn from(value: TimerRecord) -> Self {
        RecordValue::Timer(value)
    }
}

impl From<IncidentRecord> for RecordValue {
    fn from(value: IncidentRecord) -> Self {
        RecordValue::Incident(value)
    }
}

/// Entry of a partition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: u64,
    /// Position of the command this record was written in response to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<u64>,
    pub partition_id: PartitionId,
    pub key: i64,
    pub record_type: RecordType,
    pub intent: Intent,
    pub value: RecordValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl Record {
    /// A command not yet written to any log.
    pub fn command(key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Self {
        Self {
            position: 0,
            source_position: None,
            partition_id: 0,
            key,
            record_type: RecordType::Command,
            intent: intent.into(),
            value: value.into(),
            rejection: None,
            timestamp: 0,
        }
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    pub fn workflow_instance(&self) -> Option<&WorkflowInstanceRecord> {
        match &self.value {
            RecordValue::WorkflowInstance(value) => Some(value),
            _ => None,
        }
    }

    pub fn message_subscription(&self) -> Option<&MessageSubscriptionRecord> {
        match &self.value {
            RecordValue::MessageSubscription(value) => Some(value),
            _ => None,
        }
    }

    pub fn workflow_instance_subscription(&self) -> Option<&WorkflowInstanceSubscriptionRecord> {
        match &self.value {
            RecordValue::WorkflowInstanceSubscription(value) => Some(value),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&MessageRecord> {
        match &self.value {
            RecordValue::Message(value) => Some(value),
            _ => None,
        }
    }

    pub fn timer(&self) -> Option<&TimerRecord> {
        match &self.value {
            RecordValue::Timer(value) => Some(value),
            _ => None,
        }
    }

    pub fn incident(&self) -> Option<&IncidentRecord> {
        match &self.value {
            RecordValue::Incident(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_tagged_intent_and_value() {
        let mut record = Record::command(
            -1,
            TimerIntent::Trigger,
            TimerRecord {
                workflow_instance_key: 1,
                element_instance_key: 2,
                handler_element_id: "timer".into(),
                due_date: 100,
            },
        );
        record.position = 7;

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["intent"]["value_type"], "TIMER");
        assert_eq!(json["intent"]["intent"], "TRIGGER");
        assert_eq!(json["value"]["value"]["handler_element_id"], "timer");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
        assert!(back.is_command());
        assert_eq!(back.timer().map(|t| t.due_date), Some(100));
    }
}
