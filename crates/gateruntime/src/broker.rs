use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::log::{FileLogStorage, LogStorage, MemoryLogStorage};
use crate::partition::{Partition, PartitionRequest};
use crate::processor::StreamProcessor;
use crate::registry::ProcessRepository;
use crate::transport::ChannelTransport;
use gatecore::record::{
    IncidentIntent, IncidentRecord, MessageIntent, MessageRecord, WorkflowInstanceIntent,
    WorkflowInstanceRecord, BpmnElementType, ErrorType,
};
use gatecore::{
    decode_partition_id, subscription_partition_id, GateError, PartitionId, ProcessDefinition,
    Record, RecordBus, Result, Variables, START_PARTITION_ID,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A message to publish
#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub name: String,
    pub correlation_key: String,
    pub variables: Variables,
    pub time_to_live_ms: i64,
    pub message_id: Option<String>,
}

impl PublishMessage {
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_time_to_live(mut self, time_to_live_ms: i64) -> Self {
        self.time_to_live_ms = time_to_live_ms;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Entry point to a set of partitions running in this process.
///
/// Each partition runs on its own task; the broker only routes client
/// commands to the partition that owns them.
pub struct Broker {
    repository: Arc<ProcessRepository>,
    partitions: HashMap<PartitionId, mpsc::Sender<PartitionRequest>>,
    partition_count: u32,
    next_partition: AtomicU32,
    record_bus: RecordBus,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Start all partitions, recovering them from their logs
    pub async fn start(config: RuntimeConfig, repository: Arc<ProcessRepository>) -> Result<Self> {
        Self::start_with_clock(config, repository, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: RuntimeConfig,
        repository: Arc<ProcessRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let partition_count = config.partition_count.max(1);
        let partition_ids: Vec<PartitionId> =
            (START_PARTITION_ID..START_PARTITION_ID + partition_count).collect();

        let transport = Arc::new(ChannelTransport::new());
        let record_bus = RecordBus::new(config.record_buffer_size);
        let cancel = CancellationToken::new();

        let mut inbound = HashMap::new();
        for &partition_id in &partition_ids {
            let (sender, receiver) = mpsc::channel(config.transport_channel_capacity.max(1));
            transport.register(partition_id, sender);
            inbound.insert(partition_id, receiver);
        }

        let mut partitions = HashMap::new();
        let mut tasks = Vec::new();
        for partition_id in partition_ids {
            let storage: Box<dyn LogStorage> = match &config.data_dir {
                Some(data_dir) => Box::new(FileLogStorage::open(data_dir, partition_id)?),
                None => Box::new(MemoryLogStorage::new()),
            };

            let processor = StreamProcessor::builder(
                partition_id,
                partition_count,
                repository.clone(),
                transport.clone(),
            )
            .storage(storage)
            .clock(clock.clone())
            .record_bus(record_bus.clone())
            .resend_timeout_ms(config.subscription_resend_timeout_ms)
            .build()?;

            let inbound = inbound
                .remove(&partition_id)
                .ok_or(GateError::PartitionUnavailable(partition_id))?;
            let (request_sender, requests) = mpsc::channel(config.request_channel_capacity.max(1));
            let partition = Partition::new(
                processor,
                requests,
                inbound,
                config.sweep_interval(),
                cancel.child_token(),
            );

            tasks.push(tokio::spawn(partition.run()));
            partitions.insert(partition_id, request_sender);
        }

        info!(partition_count, "Broker started");
        Ok(Self {
            repository,
            partitions,
            partition_count,
            next_partition: AtomicU32::new(0),
            record_bus,
            cancel,
            tasks,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn repository(&self) -> &Arc<ProcessRepository> {
        &self.repository
    }

    /// Validate and deploy a process definition
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        Ok(self.repository.deploy(definition)?)
    }

    /// Subscribe to every record committed by any partition
    pub fn subscribe_records(&self) -> broadcast::Receiver<Record> {
        self.record_bus.subscribe()
    }

    /// Create an instance on the next partition in turn; returns its key
    pub async fn create_instance(
        &self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> Result<i64> {
        let offset = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partition_count;
        let value = WorkflowInstanceRecord::new(
            bpmn_process_id,
            -1,
            -1,
            bpmn_process_id,
            BpmnElementType::Process,
        )
        .with_variables(variables);

        self.request(
            START_PARTITION_ID + offset,
            Record::command(-1, WorkflowInstanceIntent::Create, value),
        )
        .await
    }

    /// Publish a message on the partition owning its correlation key
    pub async fn publish_message(&self, message: PublishMessage) -> Result<i64> {
        let partition_id =
            subscription_partition_id(&message.correlation_key, self.partition_count);
        let value = MessageRecord {
            name: message.name,
            correlation_key: message.correlation_key,
            variables: message.variables,
            time_to_live_ms: message.time_to_live_ms,
            message_id: message.message_id,
            deadline: 0,
        };
        self.request(partition_id, Record::command(-1, MessageIntent::Publish, value))
            .await
    }

    pub async fn cancel_instance(&self, workflow_instance_key: i64) -> Result<i64> {
        let value = WorkflowInstanceRecord::new(
            "",
            workflow_instance_key,
            -1,
            "",
            BpmnElementType::Process,
        );
        self.request(
            decode_partition_id(workflow_instance_key),
            Record::command(workflow_instance_key, WorkflowInstanceIntent::Cancel, value),
        )
        .await
    }

    /// Resolve an incident, retrying the failed step with `variables` merged in
    pub async fn resolve_incident(&self, incident_key: i64, variables: Variables) -> Result<i64> {
        let value = IncidentRecord {
            error_type: ErrorType::ConditionError,
            error_message: String::new(),
            bpmn_process_id: String::new(),
            workflow_instance_key: -1,
            element_instance_key: -1,
            element_id: String::new(),
            variables,
        };
        self.request(
            decode_partition_id(incident_key),
            Record::command(incident_key, IncidentIntent::Resolve, value),
        )
        .await
    }

    async fn request(&self, partition_id: PartitionId, command: Record) -> Result<i64> {
        let sender = self
            .partitions
            .get(&partition_id)
            .ok_or(GateError::PartitionUnavailable(partition_id))?;

        let (reply, response) = oneshot::channel();
        sender
            .send(PartitionRequest { command, reply })
            .await
            .map_err(|_| GateError::PartitionUnavailable(partition_id))?;
        response
            .await
            .map_err(|_| GateError::PartitionUnavailable(partition_id))?
    }

    /// Stop all partitions and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Broker stopped");
    }
}
