//! Stream processor of one partition.
//!
//! Every command is first appended to the log on its own. Processing it
//! yields one batch of follow-up records which is appended as a whole;
//! subscription commands for other partitions are sent only after that.
//! On restart the log is replayed into a fresh [`PartitionState`] and any
//! command without follow-up records is processed again.

mod bpmn;
mod catch;
mod context;
mod gateway;
mod message;
mod subscription;

pub use context::ProcessingContext;

use crate::clock::{Clock, SystemClock};
use crate::evaluator::{EvalexprEvaluator, ExpressionEvaluator};
use crate::log::{LogStorage, LogStream, MemoryLogStorage};
use crate::registry::ProcessRepository;
use crate::state::{PartitionState, WorkflowInstanceSubscriptionState};
use crate::transport::{PartitionTransport, SubscriptionCommandSender};
use gatecore::record::{
    IncidentIntent, MessageIntent, MessageSubscriptionIntent, TimerIntent,
    WorkflowInstanceIntent, WorkflowInstanceSubscriptionIntent,
};
use gatecore::{
    GateError, Intent, PartitionId, Record, RecordBus, RecordType, RecordValue, RejectionType,
    Result,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a command, as reported to the client that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Accepted { key: i64 },
    Rejected {
        rejection_type: RejectionType,
        reason: String,
    },
}

impl CommandResponse {
    pub fn into_result(self) -> Result<i64> {
        match self {
            CommandResponse::Accepted { key } => Ok(key),
            CommandResponse::Rejected {
                rejection_type,
                reason,
            } => Err(GateError::Rejected {
                rejection_type,
                reason,
            }),
        }
    }
}

/// Command handlers and BPMN reactions, borrowed for one processing step.
pub(crate) struct Engine<'a> {
    repository: &'a ProcessRepository,
    evaluator: &'a dyn ExpressionEvaluator,
    partition_id: PartitionId,
    partition_count: u32,
}

impl Engine<'_> {
    fn process(&self, ctx: &mut ProcessingContext<'_>, command: &Record) {
        use MessageSubscriptionIntent as Ms;
        use WorkflowInstanceSubscriptionIntent as Wis;

        match (command.intent, &command.value) {
            (
                Intent::WorkflowInstance(WorkflowInstanceIntent::Create),
                RecordValue::WorkflowInstance(value),
            ) => self.create_instance(ctx, command, value),
            (Intent::WorkflowInstance(WorkflowInstanceIntent::Cancel), _) => {
                self.cancel_instance(ctx, command)
            }
            (Intent::MessageSubscription(Ms::Open), RecordValue::MessageSubscription(value)) => {
                self.open_message_subscription(ctx, command, value)
            }
            (
                Intent::MessageSubscription(Ms::Correlate),
                RecordValue::MessageSubscription(value),
            ) => self.acknowledge_correlation(ctx, command, value),
            (Intent::MessageSubscription(Ms::Close), RecordValue::MessageSubscription(value)) => {
                self.close_message_subscription(ctx, command, value)
            }
            (Intent::MessageSubscription(Ms::Reject), RecordValue::MessageSubscription(value)) => {
                self.reject_correlation(ctx, command, value)
            }
            (
                Intent::WorkflowInstanceSubscription(Wis::Open),
                RecordValue::WorkflowInstanceSubscription(value),
            ) => self.acknowledge_open(ctx, command, value),
            (
                Intent::WorkflowInstanceSubscription(Wis::Correlate),
                RecordValue::WorkflowInstanceSubscription(value),
            ) => self.correlate_instance_subscription(ctx, command, value),
            (
                Intent::WorkflowInstanceSubscription(Wis::Close),
                RecordValue::WorkflowInstanceSubscription(value),
            ) => self.acknowledge_close(ctx, command, value),
            (Intent::Message(MessageIntent::Publish), RecordValue::Message(value)) => {
                self.publish_message(ctx, command, value)
            }
            (Intent::Message(MessageIntent::Expire), _) => self.expire_message(ctx, command),
            (Intent::Timer(TimerIntent::Trigger), _) => self.trigger_timer(ctx, command),
            (Intent::Incident(IncidentIntent::Resolve), RecordValue::Incident(value)) => {
                self.resolve_incident(ctx, command, value)
            }
            (intent, _) => ctx.reject(
                command,
                RejectionType::InvalidArgument,
                format!("unsupported command {:?}", intent),
            ),
        }

        while let Some(event) = ctx.next_reaction() {
            self.react(ctx, &event);
        }
    }
}

pub struct StreamProcessor {
    partition_id: PartitionId,
    partition_count: u32,
    log: LogStream,
    state: PartitionState,
    repository: Arc<ProcessRepository>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    sender: SubscriptionCommandSender,
    clock: Arc<dyn Clock>,
    record_bus: RecordBus,
    resend_timeout_ms: i64,
}

impl StreamProcessor {
    pub fn builder(
        partition_id: PartitionId,
        partition_count: u32,
        repository: Arc<ProcessRepository>,
        transport: Arc<dyn PartitionTransport>,
    ) -> StreamProcessorBuilder {
        StreamProcessorBuilder {
            partition_id,
            partition_count,
            repository,
            transport,
            storage: None,
            evaluator: None,
            clock: None,
            record_bus: None,
            resend_timeout_ms: 10_000,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn state(&self) -> &PartitionState {
        &self.state
    }

    pub fn next_position(&self) -> u64 {
        self.log.next_position()
    }

    fn recover(&mut self) -> Result<()> {
        let records = self.log.recover()?;

        let mut last_processed = 0;
        for record in &records {
            self.state.apply(record);
            if let Some(source_position) = record.source_position {
                last_processed = last_processed.max(source_position);
            }
        }

        let replayed = records.len();
        let unprocessed: Vec<Record> = records
            .into_iter()
            .filter(|r| r.is_command() && r.position > last_processed)
            .collect();

        info!(
            partition_id = self.partition_id,
            replayed,
            unprocessed = unprocessed.len(),
            "Recovered partition state"
        );

        for command in unprocessed {
            self.process_logged_command(&command)?;
        }
        Ok(())
    }

    /// Write a command to the log and process it.
    ///
    /// An error means the log is unusable and the partition has to stop.
    pub fn process_command(&mut self, mut command: Record) -> Result<CommandResponse> {
        command.position = self.log.next_position();
        command.source_position = None;
        command.partition_id = self.partition_id;
        command.record_type = RecordType::Command;
        command.rejection = None;
        command.timestamp = self.clock.now_millis();

        self.log.append(std::slice::from_ref(&command))?;
        self.state.apply(&command);
        self.record_bus.emit(command.clone());

        self.process_logged_command(&command)
    }

    fn process_logged_command(&mut self, command: &Record) -> Result<CommandResponse> {
        let engine = Engine {
            repository: self.repository.as_ref(),
            evaluator: self.evaluator.as_ref(),
            partition_id: self.partition_id,
            partition_count: self.partition_count,
        };

        let mut ctx = ProcessingContext::new(
            &mut self.state,
            command.position,
            self.log.next_position(),
            self.clock.now_millis(),
        );
        engine.process(&mut ctx, command);
        if ctx.is_empty() {
            ctx.reject(
                command,
                RejectionType::InvalidState,
                "command had no effect",
            );
        }

        let (records, sends, response) = ctx.finish();
        self.log.append(&records)?;

        debug!(
            partition_id = self.partition_id,
            position = command.position,
            intent = ?command.intent,
            records = records.len(),
            sends = sends.len(),
            "Processed command"
        );

        for record in records {
            self.record_bus.emit(record);
        }
        for subscription_command in &sends {
            self.sender.send(subscription_command);
        }

        Ok(response.unwrap_or(CommandResponse::Accepted { key: command.key }))
    }

    /// Trigger due timers, expire messages and resend unacknowledged
    /// subscription commands.
    pub fn run_sweeps(&mut self) -> Result<()> {
        let now = self.clock.now_millis();

        for timer_key in self.state.timers.due(now) {
            let Some(timer) = self.state.timers.get(timer_key).cloned() else {
                continue;
            };
            self.process_command(Record::command(timer_key, TimerIntent::Trigger, timer))?;
        }

        for message_key in self.state.messages.expired(now) {
            let Some(message) = self.state.messages.get(message_key).cloned() else {
                continue;
            };
            self.process_command(Record::command(message_key, MessageIntent::Expire, message))?;
        }

        self.resend_pending(now);
        Ok(())
    }

    fn resend_pending(&mut self, now: i64) {
        let sent_before = now - self.resend_timeout_ms;

        for subscription in self.state.instance_subscriptions.pending(sent_before) {
            let record = &subscription.record;
            match subscription.state {
                WorkflowInstanceSubscriptionState::Opening => {
                    self.sender.open_message_subscription(
                        record.subscription_partition_id,
                        record.workflow_instance_key,
                        record.element_instance_key,
                        &record.message_name,
                        &record.correlation_key,
                        record.close_on_correlate,
                    );
                }
                WorkflowInstanceSubscriptionState::Closing => {
                    self.sender.close_message_subscription(
                        record.subscription_partition_id,
                        record.workflow_instance_key,
                        record.element_instance_key,
                        &record.message_name,
                    );
                }
                WorkflowInstanceSubscriptionState::Opened => continue,
            }

            debug!(
                partition_id = self.partition_id,
                element_instance_key = record.element_instance_key,
                message_name = %record.message_name,
                state = ?subscription.state,
                "Resent pending subscription command"
            );
            self.state.instance_subscriptions.mark_sent(
                record.element_instance_key,
                &record.message_name,
                now,
            );
        }

        for subscription in self.state.message_subscriptions.pending_correlations(sent_before) {
            let record = &subscription.record;
            self.sender.correlate_workflow_instance_subscription(
                self.partition_id,
                record.workflow_instance_key,
                record.element_instance_key,
                record.message_key,
                &record.message_name,
                &record.correlation_key,
                &record.variables,
            );

            debug!(
                partition_id = self.partition_id,
                element_instance_key = record.element_instance_key,
                message_key = record.message_key,
                "Resent pending correlation"
            );
            self.state.message_subscriptions.mark_sent(
                record.element_instance_key,
                &record.message_name,
                now,
            );
        }
    }
}

pub struct StreamProcessorBuilder {
    partition_id: PartitionId,
    partition_count: u32,
    repository: Arc<ProcessRepository>,
    transport: Arc<dyn PartitionTransport>,
    storage: Option<Box<dyn LogStorage>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    clock: Option<Arc<dyn Clock>>,
    record_bus: Option<RecordBus>,
    resend_timeout_ms: i64,
}

impl StreamProcessorBuilder {
    pub fn storage(mut self, storage: Box<dyn LogStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn record_bus(mut self, record_bus: RecordBus) -> Self {
        self.record_bus = Some(record_bus);
        self
    }

    pub fn resend_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.resend_timeout_ms = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
        self
    }

    /// Build the processor and recover its state from the log.
    pub fn build(self) -> Result<StreamProcessor> {
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(MemoryLogStorage::new()));

        let mut processor = StreamProcessor {
            partition_id: self.partition_id,
            partition_count: self.partition_count,
            log: LogStream::new(self.partition_id, storage),
            state: PartitionState::new(self.partition_id),
            repository: self.repository,
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(EvalexprEvaluator::new())),
            sender: SubscriptionCommandSender::new(self.transport),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            record_bus: self.record_bus.unwrap_or_default(),
            resend_timeout_ms: self.resend_timeout_ms,
        };
        processor.recover()?;
        Ok(processor)
    }
}
