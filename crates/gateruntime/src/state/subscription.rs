//! Both halves of a message subscription.
//!
//! The partition owning the workflow instance tracks
//! [`WorkflowInstanceSubscription`]s, the partition owning the correlation
//! key tracks [`MessageSubscription`]s. `last_sent` is the time a command
//! for the subscription was last handed to the transport; the pending
//! sweep resends once it is older than the resend timeout.

use gatecore::record::{MessageSubscriptionRecord, WorkflowInstanceSubscriptionRecord};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSubscriptionState {
    Opened,
    Correlating,
    Closing,
}

#[derive(Debug, Clone)]
pub struct MessageSubscription {
    pub key: i64,
    pub state: MessageSubscriptionState,
    pub record: MessageSubscriptionRecord,
    pub last_sent: i64,
}

#[derive(Debug, Default)]
pub struct MessageSubscriptions {
    subscriptions: BTreeMap<(i64, String), MessageSubscription>,
}

impl MessageSubscriptions {
    pub fn get(
        &self,
        element_instance_key: i64,
        message_name: &str,
    ) -> Option<&MessageSubscription> {
        self.subscriptions
            .get(&(element_instance_key, message_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Opened subscriptions waiting for a message, in the order they were
    /// opened.
    pub fn correlatable(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> Vec<&MessageSubscription> {
        let mut matching: Vec<_> = self
            .subscriptions
            .values()
            .filter(|s| {
                s.state == MessageSubscriptionState::Opened
                    && s.record.message_name == message_name
                    && s.record.correlation_key == correlation_key
            })
            .collect();
        matching.sort_by_key(|s| s.key);
        matching
    }

    /// Correlations not acknowledged since `sent_before`.
    pub fn pending_correlations(&self, sent_before: i64) -> Vec<MessageSubscription> {
        self.subscriptions
            .values()
            .filter(|s| {
                s.state == MessageSubscriptionState::Correlating && s.last_sent <= sent_before
            })
            .cloned()
            .collect()
    }

    pub fn mark_sent(&mut self, element_instance_key: i64, message_name: &str, now: i64) {
        if let Some(subscription) = self
            .subscriptions
            .get_mut(&(element_instance_key, message_name.to_string()))
        {
            subscription.last_sent = now;
        }
    }

    fn entry_key(record: &MessageSubscriptionRecord) -> (i64, String) {
        (record.element_instance_key, record.message_name.clone())
    }

    pub(crate) fn on_opened(
        &mut self,
        key: i64,
        record: &MessageSubscriptionRecord,
        timestamp: i64,
    ) {
        self.subscriptions.insert(
            Self::entry_key(record),
            MessageSubscription {
                key,
                state: MessageSubscriptionState::Opened,
                record: record.clone(),
                last_sent: timestamp,
            },
        );
    }

    pub(crate) fn on_correlating(&mut self, record: &MessageSubscriptionRecord, timestamp: i64) {
        if let Some(subscription) = self.subscriptions.get_mut(&Self::entry_key(record)) {
            subscription.state = MessageSubscriptionState::Correlating;
            subscription.record.message_key = record.message_key;
            subscription.record.variables = record.variables.clone();
            subscription.last_sent = timestamp;
        }
    }

    pub(crate) fn on_correlated(&mut self, record: &MessageSubscriptionRecord) {
        let entry_key = Self::entry_key(record);
        let close = match self.subscriptions.get_mut(&entry_key) {
            Some(subscription) if subscription.record.close_on_correlate => true,
            Some(subscription) => {
                subscription.state = MessageSubscriptionState::Opened;
                subscription.record.message_key = -1;
                subscription.record.variables.clear();
                false
            }
            None => false,
        };
        if close {
            self.subscriptions.remove(&entry_key);
        }
    }

    pub(crate) fn on_rejected(&mut self, record: &MessageSubscriptionRecord) {
        if let Some(subscription) = self.subscriptions.get_mut(&Self::entry_key(record)) {
            if subscription.state == MessageSubscriptionState::Correlating
                && subscription.record.message_key == record.message_key
            {
                subscription.state = MessageSubscriptionState::Closing;
            }
        }
    }

    pub(crate) fn on_closed(&mut self, record: &MessageSubscriptionRecord) {
        self.subscriptions.remove(&Self::entry_key(record));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowInstanceSubscriptionState {
    Opening,
    Opened,
    Closing,
}

#[derive(Debug, Clone)]
pub struct WorkflowInstanceSubscription {
    pub state: WorkflowInstanceSubscriptionState,
    pub record: WorkflowInstanceSubscriptionRecord,
    pub last_sent: i64,
}

#[derive(Debug, Default)]
pub struct WorkflowInstanceSubscriptions {
    subscriptions: BTreeMap<(i64, String), WorkflowInstanceSubscription>,
    /// (workflow instance key, message key) pairs already correlated.
    correlated: BTreeSet<(i64, i64)>,
}

impl WorkflowInstanceSubscriptions {
    pub fn get(
        &self,
        element_instance_key: i64,
        message_name: &str,
    ) -> Option<&WorkflowInstanceSubscription> {
        self.subscriptions
            .get(&(element_instance_key, message_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn for_workflow_instance(
        &self,
        workflow_instance_key: i64,
    ) -> Vec<&WorkflowInstanceSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.record.workflow_instance_key == workflow_instance_key)
            .collect()
    }

    pub fn is_correlated(&self, workflow_instance_key: i64, message_key: i64) -> bool {
        self.correlated.contains(&(workflow_instance_key, message_key))
    }

    /// Opens and closes not acknowledged since `sent_before`.
    pub fn pending(&self, sent_before: i64) -> Vec<WorkflowInstanceSubscription> {
        self.subscriptions
            .values()
            .filter(|s| {
                s.state != WorkflowInstanceSubscriptionState::Opened && s.last_sent <= sent_before
            })
            .cloned()
            .collect()
    }

    pub fn mark_sent(&mut self, element_instance_key: i64, message_name: &str, now: i64) {
        if let Some(subscription) = self
            .subscriptions
            .get_mut(&(element_instance_key, message_name.to_string()))
        {
            subscription.last_sent = now;
        }
    }

    fn entry_key(record: &WorkflowInstanceSubscriptionRecord) -> (i64, String) {
        (record.element_instance_key, record.message_name.clone())
    }

    pub(crate) fn on_opening(
        &mut self,
        record: &WorkflowInstanceSubscriptionRecord,
        timestamp: i64,
    ) {
        self.subscriptions.insert(
            Self::entry_key(record),
            WorkflowInstanceSubscription {
                state: WorkflowInstanceSubscriptionState::Opening,
                record: record.clone(),
                last_sent: timestamp,
            },
        );
    }

    pub(crate) fn on_opened(&mut self, record: &WorkflowInstanceSubscriptionRecord) {
        if let Some(subscription) = self.subscriptions.get_mut(&Self::entry_key(record)) {
            if subscription.state == WorkflowInstanceSubscriptionState::Opening {
                subscription.state = WorkflowInstanceSubscriptionState::Opened;
            }
        }
    }

    pub(crate) fn on_correlated(&mut self, record: &WorkflowInstanceSubscriptionRecord) {
        self.correlated
            .insert((record.workflow_instance_key, record.message_key));

        let entry_key = Self::entry_key(record);
        let close = self
            .subscriptions
            .get(&entry_key)
            .map_or(false, |s| s.record.close_on_correlate);
        if close {
            self.subscriptions.remove(&entry_key);
        }
    }

    pub(crate) fn on_closing(
        &mut self,
        record: &WorkflowInstanceSubscriptionRecord,
        timestamp: i64,
    ) {
        if let Some(subscription) = self.subscriptions.get_mut(&Self::entry_key(record)) {
            subscription.state = WorkflowInstanceSubscriptionState::Closing;
            subscription.last_sent = timestamp;
        }
    }

    pub(crate) fn on_closed(&mut self, record: &WorkflowInstanceSubscriptionRecord) {
        self.subscriptions.remove(&Self::entry_key(record));
    }

    pub(crate) fn on_instance_finished(&mut self, workflow_instance_key: i64) {
        self.correlated
            .retain(|(instance, _)| *instance != workflow_instance_key);
    }
}
