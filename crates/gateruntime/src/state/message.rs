use gatecore::record::MessageRecord;
use std::collections::{BTreeMap, BTreeSet};

/// Buffered messages of a subscription partition
#[derive(Debug, Default)]
pub struct Messages {
    messages: BTreeMap<i64, MessageRecord>,
    /// (message key, workflow instance key) of every correlation handed out.
    correlations: BTreeSet<(i64, i64)>,
}

impl Messages {
    pub fn get(&self, key: i64) -> Option<&MessageRecord> {
        self.messages.get(&key)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn exists_with_id(&self, name: &str, correlation_key: &str, message_id: &str) -> bool {
        self.messages.values().any(|m| {
            m.name == name
                && m.correlation_key == correlation_key
                && m.message_id.as_deref() == Some(message_id)
        })
    }

    /// Oldest live message the instance has not been correlated to yet.
    pub fn find_correlatable(
        &self,
        name: &str,
        correlation_key: &str,
        workflow_instance_key: i64,
        now: i64,
    ) -> Option<(i64, &MessageRecord)> {
        self.messages
            .iter()
            .find(|(key, m)| {
                m.name == name
                    && m.correlation_key == correlation_key
                    && m.deadline > now
                    && !self.is_correlated(**key, workflow_instance_key)
            })
            .map(|(key, m)| (*key, m))
    }

    pub fn is_correlated(&self, message_key: i64, workflow_instance_key: i64) -> bool {
        self.correlations
            .contains(&(message_key, workflow_instance_key))
    }

    pub fn expired(&self, now: i64) -> Vec<i64> {
        self.messages
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(key, _)| *key)
            .collect()
    }

    pub(crate) fn on_published(&mut self, key: i64, record: &MessageRecord) {
        self.messages.insert(key, record.clone());
    }

    pub(crate) fn on_deleted(&mut self, key: i64) {
        self.messages.remove(&key);
        self.correlations.retain(|(message, _)| *message != key);
    }

    pub(crate) fn on_correlating(&mut self, message_key: i64, workflow_instance_key: i64) {
        if self.messages.contains_key(&message_key) {
            self.correlations
                .insert((message_key, workflow_instance_key));
        }
    }

    pub(crate) fn on_rejected(&mut self, message_key: i64, workflow_instance_key: i64) {
        self.correlations
            .remove(&(message_key, workflow_instance_key));
    }
}
