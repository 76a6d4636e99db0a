//! Deterministic multi-partition harness.
//!
//! Partitions are driven synchronously: every subscription command lands in
//! one queue and is only delivered when a test says so, which lets tests
//! reorder, drop and duplicate traffic between partitions.

#![allow(dead_code)]

use bytes::Bytes;
use gatecore::codec::SubscriptionCommand;
use gatecore::record::{
    BpmnElementType, IncidentIntent, IncidentRecord, MessageIntent, MessageRecord,
    WorkflowInstanceIntent, WorkflowInstanceRecord, ErrorType,
};
use gatecore::{
    decode_partition_id, subscription_partition_id, variables_from_json, Intent, PartitionId,
    ProcessDefinition, Record, Variables, START_PARTITION_ID,
};
use gateruntime::{
    Clock, CommandResponse, ControlledClock, LogStorage, MemoryLogStorage, PartitionTransport,
    ProcessRepository, StreamProcessor, SubscriptionCommandHandler,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Once};

pub const START_MILLIS: i64 = 1_000_000;
pub const RESEND_TIMEOUT_MS: u64 = 10_000;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn vars(json: serde_json::Value) -> Variables {
    variables_from_json(json).expect("variables must be a JSON object")
}

#[derive(Default)]
pub struct QueueTransport {
    queue: Mutex<VecDeque<(PartitionId, Bytes)>>,
}

impl PartitionTransport for QueueTransport {
    fn send(&self, partition_id: PartitionId, payload: Bytes) -> bool {
        self.queue.lock().unwrap().push_back((partition_id, payload));
        true
    }
}

impl QueueTransport {
    fn pop(&self) -> Option<(PartitionId, Bytes)> {
        self.queue.lock().unwrap().pop_front()
    }

    fn snapshot(&self) -> Vec<(PartitionId, Bytes)> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

pub struct TestCluster {
    pub clock: Arc<ControlledClock>,
    pub repository: Arc<ProcessRepository>,
    transport: Arc<QueueTransport>,
    storages: BTreeMap<PartitionId, MemoryLogStorage>,
    processors: BTreeMap<PartitionId, StreamProcessor>,
    partition_count: u32,
}

impl TestCluster {
    pub fn new(partition_count: u32) -> Self {
        init_tracing();

        let mut cluster = Self {
            clock: Arc::new(ControlledClock::new(START_MILLIS)),
            repository: Arc::new(ProcessRepository::new()),
            transport: Arc::new(QueueTransport::default()),
            storages: BTreeMap::new(),
            processors: BTreeMap::new(),
            partition_count,
        };
        for partition_id in START_PARTITION_ID..START_PARTITION_ID + partition_count {
            cluster
                .storages
                .insert(partition_id, MemoryLogStorage::new());
            cluster.start_partition(partition_id);
        }
        cluster
    }

    pub fn with_process(partition_count: u32, definition: ProcessDefinition) -> Self {
        let cluster = Self::new(partition_count);
        cluster.repository.deploy(definition).unwrap();
        cluster
    }

    fn start_partition(&mut self, partition_id: PartitionId) {
        let storage = self.storages[&partition_id].clone();
        let processor = StreamProcessor::builder(
            partition_id,
            self.partition_count,
            self.repository.clone(),
            self.transport.clone(),
        )
        .storage(Box::new(storage))
        .clock(self.clock.clone())
        .resend_timeout_ms(RESEND_TIMEOUT_MS)
        .build()
        .unwrap();
        self.processors.insert(partition_id, processor);
    }

    /// Throw away a partition's in-memory state and rebuild it from its log.
    pub fn restart(&mut self, partition_id: PartitionId) {
        self.processors.remove(&partition_id);
        self.start_partition(partition_id);
    }

    /// Append a command straight to a partition's log, as if the partition
    /// crashed right after writing it.
    pub fn append_command(&mut self, partition_id: PartitionId, mut command: Record) {
        let storage = self.storages.get_mut(&partition_id).unwrap();
        command.position = storage.records().last().map_or(1, |r| r.position + 1);
        command.partition_id = partition_id;
        command.timestamp = self.clock.now_millis();
        storage.append(std::slice::from_ref(&command)).unwrap();
    }

    pub fn processor(&self, partition_id: PartitionId) -> &StreamProcessor {
        &self.processors[&partition_id]
    }

    pub fn partition_of_key(&self, correlation_key: &str) -> PartitionId {
        subscription_partition_id(correlation_key, self.partition_count)
    }

    pub fn command(&mut self, partition_id: PartitionId, command: Record) -> CommandResponse {
        self.processors
            .get_mut(&partition_id)
            .unwrap()
            .process_command(command)
            .unwrap()
    }

    pub fn create_instance(&mut self, bpmn_process_id: &str, variables: Variables) -> i64 {
        let value = WorkflowInstanceRecord::new(
            bpmn_process_id,
            -1,
            -1,
            bpmn_process_id,
            BpmnElementType::Process,
        )
        .with_variables(variables);
        match self.command(
            START_PARTITION_ID,
            Record::command(-1, WorkflowInstanceIntent::Create, value),
        ) {
            CommandResponse::Accepted { key } => key,
            rejected => panic!("instance creation rejected: {:?}", rejected),
        }
    }

    pub fn publish(
        &mut self,
        name: &str,
        correlation_key: &str,
        variables: Variables,
        time_to_live_ms: i64,
    ) -> CommandResponse {
        self.publish_with_id(name, correlation_key, variables, time_to_live_ms, None)
    }

    pub fn publish_with_id(
        &mut self,
        name: &str,
        correlation_key: &str,
        variables: Variables,
        time_to_live_ms: i64,
        message_id: Option<&str>,
    ) -> CommandResponse {
        let value = MessageRecord {
            name: name.into(),
            correlation_key: correlation_key.into(),
            variables,
            time_to_live_ms,
            message_id: message_id.map(String::from),
            deadline: 0,
        };
        let partition_id = self.partition_of_key(correlation_key);
        self.command(partition_id, Record::command(-1, MessageIntent::Publish, value))
    }

    pub fn cancel(&mut self, workflow_instance_key: i64) -> CommandResponse {
        let value = WorkflowInstanceRecord::new(
            "",
            workflow_instance_key,
            -1,
            "",
            BpmnElementType::Process,
        );
        self.command(
            decode_partition_id(workflow_instance_key),
            Record::command(workflow_instance_key, WorkflowInstanceIntent::Cancel, value),
        )
    }

    pub fn resolve_incident(&mut self, incident_key: i64, variables: Variables) -> CommandResponse {
        let value = IncidentRecord {
            error_type: ErrorType::ConditionError,
            error_message: String::new(),
            bpmn_process_id: String::new(),
            workflow_instance_key: -1,
            element_instance_key: -1,
            element_id: String::new(),
            variables,
        };
        self.command(
            decode_partition_id(incident_key),
            Record::command(incident_key, IncidentIntent::Resolve, value),
        )
    }

    /// Commands waiting for delivery, oldest first.
    pub fn pending(&self) -> Vec<(PartitionId, SubscriptionCommand)> {
        self.transport
            .snapshot()
            .into_iter()
            .map(|(partition_id, payload)| {
                (partition_id, SubscriptionCommand::decode(&payload).unwrap())
            })
            .collect()
    }

    pub fn deliver_next(&mut self) -> bool {
        let Some((partition_id, payload)) = self.transport.pop() else {
            return false;
        };
        self.deliver(partition_id, &payload);
        true
    }

    pub fn deliver(&mut self, partition_id: PartitionId, payload: &[u8]) {
        if let Some(command) = SubscriptionCommandHandler::handle(payload) {
            self.command(partition_id, command);
        }
    }

    pub fn drop_next(&mut self) -> Option<(PartitionId, SubscriptionCommand)> {
        self.transport.pop().map(|(partition_id, payload)| {
            (partition_id, SubscriptionCommand::decode(&payload).unwrap())
        })
    }

    pub fn drop_all(&mut self) -> usize {
        let mut dropped = 0;
        while self.transport.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Deliver until no partition has anything left to say.
    pub fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
            assert!(delivered < 10_000, "subscription commands never settle");
        }
        delivered
    }

    pub fn advance_clock(&self, millis: i64) {
        self.clock.advance(millis);
    }

    pub fn sweep_all(&mut self) {
        for processor in self.processors.values_mut() {
            processor.run_sweeps().unwrap();
        }
    }

    pub fn records(&self, partition_id: PartitionId) -> Vec<Record> {
        self.storages[&partition_id].records()
    }

    pub fn all_records(&self) -> Vec<Record> {
        self.storages
            .values()
            .flat_map(|storage| storage.records())
            .collect()
    }

    /// Committed events with the given intent, across all partitions.
    pub fn events(&self, intent: impl Into<Intent>) -> Vec<Record> {
        let intent = intent.into();
        self.all_records()
            .into_iter()
            .filter(|r| r.is_event() && r.intent == intent)
            .collect()
    }

    pub fn rejections(&self, intent: impl Into<Intent>) -> Vec<Record> {
        let intent = intent.into();
        self.all_records()
            .into_iter()
            .filter(|r| r.is_rejection() && r.intent == intent)
            .collect()
    }

    /// Element ids of workflow instance events with the given intent, in
    /// log order.
    pub fn element_ids(&self, intent: WorkflowInstanceIntent) -> Vec<String> {
        self.events(intent)
            .into_iter()
            .filter_map(|r| r.workflow_instance().map(|v| v.element_id.clone()))
            .collect()
    }

    pub fn is_completed(&self, workflow_instance_key: i64) -> bool {
        self.events(WorkflowInstanceIntent::ElementCompleted)
            .iter()
            .any(|r| r.key == workflow_instance_key)
    }

    pub fn process_variables(&self, workflow_instance_key: i64) -> Option<Variables> {
        self.events(WorkflowInstanceIntent::ElementCompleted)
            .into_iter()
            .find(|r| r.key == workflow_instance_key)
            .and_then(|r| r.workflow_instance().map(|v| v.variables.clone()))
    }
}
