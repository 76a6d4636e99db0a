use super::CommandResponse;
use crate::state::PartitionState;
use gatecore::codec::SubscriptionCommand;
use gatecore::record::Rejection;
use gatecore::{Intent, PartitionId, Record, RecordType, RecordValue, RejectionType};
use tracing::debug;

/// Collects everything one command produces.
///
/// Events are applied to the partition state the moment they are written,
/// so later steps of the same command observe them. Subscription commands
/// are only collected; the processor sends them once the batch is durable.
pub struct ProcessingContext<'a> {
    pub state: &'a mut PartitionState,
    partition_id: PartitionId,
    source_position: u64,
    next_position: u64,
    timestamp: i64,
    records: Vec<Record>,
    sends: Vec<SubscriptionCommand>,
    reacted: usize,
    response: Option<CommandResponse>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(
        state: &'a mut PartitionState,
        source_position: u64,
        next_position: u64,
        timestamp: i64,
    ) -> Self {
        Self {
            partition_id: state.partition_id(),
            state,
            source_position,
            next_position,
            timestamp,
            records: Vec::new(),
            sends: Vec::new(),
            reacted: 0,
            response: None,
        }
    }

    pub fn now(&self) -> i64 {
        self.timestamp
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn next_key(&mut self) -> i64 {
        self.state.keys.next_key()
    }

    fn next_record(
        &mut self,
        record_type: RecordType,
        key: i64,
        intent: Intent,
        value: RecordValue,
    ) -> Record {
        let position = self.next_position;
        self.next_position += 1;
        Record {
            position,
            source_position: Some(self.source_position),
            partition_id: self.partition_id,
            key,
            record_type,
            intent,
            value,
            rejection: None,
            timestamp: self.timestamp,
        }
    }

    pub fn write_event(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) {
        let record = self.next_record(RecordType::Event, key, intent.into(), value.into());
        self.state.apply(&record);
        self.records.push(record);
    }

    pub fn reject(
        &mut self,
        command: &Record,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        debug!(
            partition_id = self.partition_id,
            position = command.position,
            intent = ?command.intent,
            ?rejection_type,
            %reason,
            "Rejecting command"
        );

        let mut record = self.next_record(
            RecordType::CommandRejection,
            command.key,
            command.intent,
            command.value.clone(),
        );
        record.rejection = Some(Rejection {
            rejection_type,
            reason: reason.clone(),
        });
        self.records.push(record);
        self.response = Some(CommandResponse::Rejected {
            rejection_type,
            reason,
        });
    }

    pub fn accept(&mut self, key: i64) {
        self.response = Some(CommandResponse::Accepted { key });
    }

    pub fn send(&mut self, command: SubscriptionCommand) {
        self.sends.push(command);
    }

    /// Next written event the engine has not reacted to yet.
    pub fn next_reaction(&mut self) -> Option<Record> {
        while self.reacted < self.records.len() {
            let record = &self.records[self.reacted];
            self.reacted += 1;
            if record.is_event() {
                return Some(record.clone());
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> (Vec<Record>, Vec<SubscriptionCommand>, Option<CommandResponse>) {
        (self.records, self.sends, self.response)
    }
}
