//! Commands handled by the partition owning a correlation key: published
//! messages and the message side of subscriptions.

use super::{Engine, ProcessingContext};
use crate::state::MessageSubscriptionState;
use crate::transport::encode_variables;
use gatecore::codec::{
    CloseWorkflowInstanceSubscription, CorrelateWorkflowInstanceSubscription,
    OpenWorkflowInstanceSubscription, SubscriptionCommand,
};
use gatecore::record::{
    MessageIntent, MessageRecord, MessageSubscriptionIntent, MessageSubscriptionRecord,
};
use gatecore::{Record, RejectionType, Variables};
use std::collections::BTreeSet;
use tracing::debug;

impl Engine<'_> {
    pub(super) fn open_message_subscription(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &MessageSubscriptionRecord,
    ) {
        let ack = SubscriptionCommand::OpenWorkflowInstanceSubscription(
            OpenWorkflowInstanceSubscription {
                subscription_partition_id: self.partition_id,
                workflow_instance_key: value.workflow_instance_key,
                element_instance_key: value.element_instance_key,
                close_on_correlate: value.close_on_correlate,
                message_name: value.message_name.clone(),
            },
        );

        if ctx
            .state
            .message_subscriptions
            .get(value.element_instance_key, &value.message_name)
            .is_some()
        {
            // the acknowledgement was probably lost
            ctx.send(ack);
            ctx.reject(
                command,
                RejectionType::AlreadyExists,
                format!(
                    "subscription for element {} and message '{}' is already open",
                    value.element_instance_key, value.message_name
                ),
            );
            return;
        }

        let mut subscription = value.clone();
        subscription.message_key = -1;
        subscription.variables = Variables::new();

        let key = ctx.next_key();
        ctx.write_event(key, MessageSubscriptionIntent::Opened, subscription.clone());
        ctx.send(ack);
        ctx.accept(key);

        let now = ctx.now();
        let buffered = ctx
            .state
            .messages
            .find_correlatable(
                &subscription.message_name,
                &subscription.correlation_key,
                subscription.workflow_instance_key,
                now,
            )
            .map(|(message_key, message)| (message_key, message.variables.clone()));
        if let Some((message_key, variables)) = buffered {
            self.correlate_message(ctx, key, &subscription, message_key, &variables);
        }
    }

    pub(super) fn publish_message(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &MessageRecord,
    ) {
        if let Some(message_id) = &value.message_id {
            if ctx
                .state
                .messages
                .exists_with_id(&value.name, &value.correlation_key, message_id)
            {
                ctx.reject(
                    command,
                    RejectionType::AlreadyExists,
                    format!(
                        "message '{}' with id '{}' was already published",
                        value.name, message_id
                    ),
                );
                return;
            }
        }

        let mut message = value.clone();
        message.deadline = ctx.now().saturating_add(value.time_to_live_ms.max(0));

        let key = ctx.next_key();
        ctx.write_event(key, MessageIntent::Published, message.clone());
        ctx.accept(key);

        let subscriptions: Vec<(i64, MessageSubscriptionRecord)> = ctx
            .state
            .message_subscriptions
            .correlatable(&message.name, &message.correlation_key)
            .into_iter()
            .map(|s| (s.key, s.record.clone()))
            .collect();

        // a message correlates at most once per workflow instance
        let mut instances = BTreeSet::new();
        for (subscription_key, subscription) in subscriptions {
            if !instances.insert(subscription.workflow_instance_key) {
                continue;
            }
            self.correlate_message(ctx, subscription_key, &subscription, key, &message.variables);
        }

        if value.time_to_live_ms <= 0 {
            ctx.write_event(key, MessageIntent::Deleted, message);
        }
    }

    pub(super) fn expire_message(&self, ctx: &mut ProcessingContext<'_>, command: &Record) {
        match ctx.state.messages.get(command.key).cloned() {
            Some(message) => {
                ctx.write_event(command.key, MessageIntent::Deleted, message);
                ctx.accept(command.key);
            }
            None => ctx.reject(
                command,
                RejectionType::NotFound,
                format!("no message with key {}", command.key),
            ),
        }
    }

    /// The instance partition confirmed a correlation.
    pub(super) fn acknowledge_correlation(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &MessageSubscriptionRecord,
    ) {
        let subscription = ctx
            .state
            .message_subscriptions
            .get(value.element_instance_key, &value.message_name)
            .map(|s| (s.key, s.state, s.record.clone()));

        match subscription {
            Some((key, MessageSubscriptionState::Correlating, record))
                if record.message_key == value.message_key =>
            {
                ctx.write_event(key, MessageSubscriptionIntent::Correlated, record);
                ctx.accept(key);
            }
            Some(_) => ctx.reject(
                command,
                RejectionType::InvalidState,
                format!(
                    "subscription for element {} is not correlating message {}",
                    value.element_instance_key, value.message_key
                ),
            ),
            None => ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "no subscription for element {} and message '{}'",
                    value.element_instance_key, value.message_name
                ),
            ),
        }
    }

    pub(super) fn close_message_subscription(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &MessageSubscriptionRecord,
    ) {
        ctx.send(SubscriptionCommand::CloseWorkflowInstanceSubscription(
            CloseWorkflowInstanceSubscription {
                subscription_partition_id: self.partition_id,
                workflow_instance_key: value.workflow_instance_key,
                element_instance_key: value.element_instance_key,
                message_name: value.message_name.clone(),
            },
        ));

        let subscription = ctx
            .state
            .message_subscriptions
            .get(value.element_instance_key, &value.message_name)
            .map(|s| (s.key, s.record.clone()));
        match subscription {
            Some((key, record)) => {
                ctx.write_event(key, MessageSubscriptionIntent::Closed, record);
                ctx.accept(key);
            }
            None => ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "no subscription for element {} and message '{}'",
                    value.element_instance_key, value.message_name
                ),
            ),
        }
    }

    /// The instance partition refused a correlation. Forget it and offer the
    /// message to the next waiting subscription.
    pub(super) fn reject_correlation(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &MessageSubscriptionRecord,
    ) {
        let message_key = value.message_key;
        if !ctx
            .state
            .messages
            .is_correlated(message_key, value.workflow_instance_key)
        {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "message {} is not correlated to workflow instance {}",
                    message_key, value.workflow_instance_key
                ),
            );
            return;
        }

        ctx.write_event(message_key, MessageSubscriptionIntent::Rejected, value.clone());
        ctx.accept(message_key);

        let Some(message) = ctx.state.messages.get(message_key).cloned() else {
            return;
        };
        let candidates: Vec<(i64, MessageSubscriptionRecord)> = ctx
            .state
            .message_subscriptions
            .correlatable(&message.name, &message.correlation_key)
            .into_iter()
            .filter(|s| {
                !(s.record.element_instance_key == value.element_instance_key
                    && s.record.message_name == value.message_name)
            })
            .map(|s| (s.key, s.record.clone()))
            .collect();

        let mut instances = BTreeSet::new();
        for (subscription_key, subscription) in candidates {
            let workflow_instance_key = subscription.workflow_instance_key;
            if ctx.state.messages.is_correlated(message_key, workflow_instance_key)
                || !instances.insert(workflow_instance_key)
            {
                continue;
            }
            self.correlate_message(
                ctx,
                subscription_key,
                &subscription,
                message_key,
                &message.variables,
            );
        }
    }

    fn correlate_message(
        &self,
        ctx: &mut ProcessingContext<'_>,
        subscription_key: i64,
        subscription: &MessageSubscriptionRecord,
        message_key: i64,
        variables: &Variables,
    ) {
        let mut correlating = subscription.clone();
        correlating.message_key = message_key;
        correlating.variables = variables.clone();
        ctx.write_event(
            subscription_key,
            MessageSubscriptionIntent::Correlating,
            correlating,
        );

        ctx.send(SubscriptionCommand::CorrelateWorkflowInstanceSubscription(
            CorrelateWorkflowInstanceSubscription {
                subscription_partition_id: self.partition_id,
                workflow_instance_key: subscription.workflow_instance_key,
                element_instance_key: subscription.element_instance_key,
                message_key,
                message_name: subscription.message_name.clone(),
                correlation_key: subscription.correlation_key.clone(),
                variables: encode_variables(variables),
            },
        ));

        debug!(
            partition_id = self.partition_id,
            message_key,
            workflow_instance_key = subscription.workflow_instance_key,
            element_instance_key = subscription.element_instance_key,
            "Correlating message"
        );
    }
}
