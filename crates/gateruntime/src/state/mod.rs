//! Partition state, rebuilt from the log.
//!
//! State only changes by applying events. The processor applies each event
//! as it writes it; replay applies the same events in log order, so both
//! paths end up with identical state.

mod element;
mod message;
mod subscription;
mod timer;

pub use element::{
    ArrivalQueues, CatchHandle, ElementInstance, ElementInstances, ElementState, EventScope,
};
pub use message::Messages;
pub use subscription::{
    MessageSubscription, MessageSubscriptionState, MessageSubscriptions,
    WorkflowInstanceSubscription, WorkflowInstanceSubscriptionState,
    WorkflowInstanceSubscriptions,
};
pub use timer::{Incidents, Timers};

use gatecore::record::{
    BpmnElementType, IncidentIntent, MessageIntent, MessageSubscriptionIntent, TimerIntent,
    WorkflowInstanceIntent, WorkflowInstanceRecord, WorkflowInstanceSubscriptionIntent,
};
use gatecore::{Intent, KeyGenerator, PartitionId, Record, RecordValue};
use tracing::warn;

pub struct PartitionState {
    partition_id: PartitionId,
    pub elements: ElementInstances,
    pub instance_subscriptions: WorkflowInstanceSubscriptions,
    pub message_subscriptions: MessageSubscriptions,
    pub messages: Messages,
    pub timers: Timers,
    pub incidents: Incidents,
    pub keys: KeyGenerator,
}

impl PartitionState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            elements: ElementInstances::default(),
            instance_subscriptions: WorkflowInstanceSubscriptions::default(),
            message_subscriptions: MessageSubscriptions::default(),
            messages: Messages::default(),
            timers: Timers::default(),
            incidents: Incidents::default(),
            keys: KeyGenerator::new(partition_id),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Apply a committed record. Commands and rejections only advance the
    /// key generator.
    pub fn apply(&mut self, record: &Record) {
        self.keys.observe(record.key);
        if !record.is_event() {
            return;
        }

        let key = record.key;
        let timestamp = record.timestamp;
        match (&record.intent, &record.value) {
            (Intent::WorkflowInstance(intent), RecordValue::WorkflowInstance(value)) => {
                self.apply_workflow_instance(*intent, key, value)
            }
            (Intent::MessageSubscription(intent), RecordValue::MessageSubscription(value)) => {
                match intent {
                    MessageSubscriptionIntent::Opened => {
                        self.message_subscriptions.on_opened(key, value, timestamp)
                    }
                    MessageSubscriptionIntent::Correlating => {
                        self.message_subscriptions.on_correlating(value, timestamp);
                        self.messages
                            .on_correlating(value.message_key, value.workflow_instance_key);
                    }
                    MessageSubscriptionIntent::Correlated => {
                        self.message_subscriptions.on_correlated(value)
                    }
                    MessageSubscriptionIntent::Rejected => {
                        self.message_subscriptions.on_rejected(value);
                        self.messages
                            .on_rejected(value.message_key, value.workflow_instance_key);
                    }
                    MessageSubscriptionIntent::Closed => {
                        self.message_subscriptions.on_closed(value)
                    }
                    _ => {}
                }
            }
            (
                Intent::WorkflowInstanceSubscription(intent),
                RecordValue::WorkflowInstanceSubscription(value),
            ) => match intent {
                WorkflowInstanceSubscriptionIntent::Opening => {
                    self.instance_subscriptions.on_opening(value, timestamp);
                    self.elements.register_handler(
                        value.element_instance_key,
                        &value.handler_element_id,
                        CatchHandle::Message {
                            message_name: value.message_name.clone(),
                        },
                    );
                }
                WorkflowInstanceSubscriptionIntent::Opened => {
                    self.instance_subscriptions.on_opened(value)
                }
                WorkflowInstanceSubscriptionIntent::Correlated => {
                    self.instance_subscriptions.on_correlated(value)
                }
                WorkflowInstanceSubscriptionIntent::Closing => {
                    self.instance_subscriptions.on_closing(value, timestamp)
                }
                WorkflowInstanceSubscriptionIntent::Closed => {
                    self.instance_subscriptions.on_closed(value)
                }
                _ => {}
            },
            (Intent::Message(intent), RecordValue::Message(value)) => match intent {
                MessageIntent::Published => self.messages.on_published(key, value),
                MessageIntent::Deleted => self.messages.on_deleted(key),
                _ => {}
            },
            (Intent::Timer(intent), RecordValue::Timer(value)) => match intent {
                TimerIntent::Created => {
                    self.timers.on_created(key, value);
                    self.elements.register_handler(
                        value.element_instance_key,
                        &value.handler_element_id,
                        CatchHandle::Timer { timer_key: key },
                    );
                }
                TimerIntent::Triggered | TimerIntent::Canceled => self.timers.on_removed(key),
                _ => {}
            },
            (Intent::Incident(intent), RecordValue::Incident(value)) => match intent {
                IncidentIntent::Created => self.incidents.on_created(key, value),
                IncidentIntent::Resolved => self.incidents.on_resolved(key),
                _ => {}
            },
            (intent, _) => {
                warn!(
                    partition_id = self.partition_id,
                    position = record.position,
                    ?intent,
                    "Event value does not match its intent, skipping"
                );
            }
        }
    }

    fn apply_workflow_instance(
        &mut self,
        intent: WorkflowInstanceIntent,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        match intent {
            WorkflowInstanceIntent::ElementActivating => self.elements.on_activating(key, value),
            WorkflowInstanceIntent::ElementActivated | WorkflowInstanceIntent::GatewayActivated => {
                self.elements
                    .on_state(key, ElementState::Activated, &value.variables)
            }
            WorkflowInstanceIntent::ElementCompleting => {
                self.elements
                    .on_state(key, ElementState::Completing, &value.variables)
            }
            WorkflowInstanceIntent::ElementTerminating => {
                self.elements
                    .on_state(key, ElementState::Terminating, &value.variables)
            }
            WorkflowInstanceIntent::ElementCompleted
            | WorkflowInstanceIntent::ElementTerminated => {
                self.elements.on_removed(key);
                if value.element_type == BpmnElementType::Process {
                    self.instance_subscriptions
                        .on_instance_finished(value.workflow_instance_key);
                }
            }
            WorkflowInstanceIntent::SequenceFlowTaken => self.elements.on_flow_taken(value),
            WorkflowInstanceIntent::CatchEventTriggering => self.elements.on_triggering(key),
            WorkflowInstanceIntent::CatchEventTriggered => {
                self.elements.on_triggered(key, &value.variables)
            }
            WorkflowInstanceIntent::Create | WorkflowInstanceIntent::Cancel => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatecore::Value;

    fn event(key: i64, intent: WorkflowInstanceIntent, value: WorkflowInstanceRecord) -> Record {
        let mut record = Record::command(key, intent, value);
        record.record_type = gatecore::RecordType::Event;
        record
    }

    fn element(scope: i64, id: &str, element_type: BpmnElementType) -> WorkflowInstanceRecord {
        WorkflowInstanceRecord::new("process", 1, scope, id, element_type)
    }

    #[test]
    fn join_arrivals_queue_per_flow_and_are_consumed_once() {
        let mut state = PartitionState::new(1);
        state.apply(&event(
            1,
            WorkflowInstanceIntent::ElementActivating,
            element(-1, "process", BpmnElementType::Process),
        ));

        for (key, flow, value) in [(2, "a", 1.0), (3, "a", 2.0), (4, "b", 3.0)] {
            let mut taken = element(1, flow, BpmnElementType::SequenceFlow);
            taken.target_element_id = Some("join".into());
            taken.variables.insert("v".into(), Value::Number(value));
            state.apply(&event(key, WorkflowInstanceIntent::SequenceFlowTaken, taken));
        }

        let queues = state.elements.arrivals(1, "join").unwrap();
        assert_eq!(queues["a"].len(), 2);
        assert!(!state.elements.is_scope_idle(1));

        let mut join = element(1, "join", BpmnElementType::ParallelGateway);
        join.consumed_flows = vec!["a".into(), "b".into()];
        state.apply(&event(5, WorkflowInstanceIntent::ElementActivating, join));

        let queues = state.elements.arrivals(1, "join").unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues["a"][0]["v"], Value::Number(2.0));
        assert_eq!(state.elements.children(1), vec![5]);
    }

    #[test]
    fn removing_a_scope_drops_its_children_and_arrivals() {
        let mut state = PartitionState::new(1);
        let process = element(-1, "process", BpmnElementType::Process);
        state.apply(&event(1, WorkflowInstanceIntent::ElementActivating, process.clone()));

        let mut taken = element(1, "flow", BpmnElementType::SequenceFlow);
        taken.target_element_id = Some("join".into());
        state.apply(&event(2, WorkflowInstanceIntent::SequenceFlowTaken, taken));

        state.apply(&event(1, WorkflowInstanceIntent::ElementTerminated, process));
        assert!(state.elements.is_empty());
        assert!(state.elements.arrivals(1, "join").is_none());
    }

    #[test]
    fn commands_only_advance_keys() {
        let mut state = PartitionState::new(1);
        let key = gatecore::encode_partition_id(1, 41);
        state.apply(&Record::command(
            key,
            WorkflowInstanceIntent::ElementActivating,
            element(-1, "process", BpmnElementType::Process),
        ));

        assert!(state.elements.is_empty());
        assert_eq!(state.keys.next_key(), gatecore::encode_partition_id(1, 42));
    }
}
