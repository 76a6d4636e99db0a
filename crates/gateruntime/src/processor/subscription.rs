//! Commands handled by the partition owning a workflow instance: the
//! instance side of subscriptions and timer triggers.

use super::{Engine, ProcessingContext};
use crate::state::WorkflowInstanceSubscriptionState;
use gatecore::codec::{
    CloseMessageSubscription, CorrelateMessageSubscription, RejectCorrelateMessageSubscription,
    SubscriptionCommand,
};
use gatecore::record::{
    TimerIntent, WorkflowInstanceSubscriptionIntent, WorkflowInstanceSubscriptionRecord,
};
use gatecore::{Record, RejectionType, Variables};
use tracing::debug;

impl Engine<'_> {
    pub(super) fn acknowledge_open(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &WorkflowInstanceSubscriptionRecord,
    ) {
        let subscription = ctx
            .state
            .instance_subscriptions
            .get(value.element_instance_key, &value.message_name)
            .map(|s| (s.state, s.record.clone()));

        match subscription {
            Some((WorkflowInstanceSubscriptionState::Opening, record)) => {
                ctx.write_event(
                    value.element_instance_key,
                    WorkflowInstanceSubscriptionIntent::Opened,
                    record,
                );
                ctx.accept(value.element_instance_key);
            }
            Some((state, _)) => ctx.reject(
                command,
                RejectionType::InvalidState,
                format!("subscription is {:?}, not opening", state),
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

    /// A message was correlated to one of this partition's subscriptions.
    ///
    /// Duplicates are acknowledged again. A correlation that can no longer
    /// trigger anything is refused so the message partition can offer the
    /// message elsewhere.
    pub(super) fn correlate_instance_subscription(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &WorkflowInstanceSubscriptionRecord,
    ) {
        let workflow_instance_key = value.workflow_instance_key;
        let element_instance_key = value.element_instance_key;
        let message_key = value.message_key;

        if ctx
            .state
            .instance_subscriptions
            .is_correlated(workflow_instance_key, message_key)
        {
            ctx.send(correlate_ack(value));
            ctx.reject(
                command,
                RejectionType::AlreadyExists,
                format!(
                    "message {} is already correlated to workflow instance {}",
                    message_key, workflow_instance_key
                ),
            );
            return;
        }

        let subscription = ctx
            .state
            .instance_subscriptions
            .get(element_instance_key, &value.message_name)
            .map(|s| (s.state, s.record.clone()));
        let subscription = match subscription {
            Some((WorkflowInstanceSubscriptionState::Closing, _)) => {
                self.refuse_correlation(ctx, command, value, "subscription is closing");
                return;
            }
            Some((_, record)) => record,
            None => {
                // nothing left here to send a close, so the message side
                // gets one along with the refusal
                self.refuse_correlation(ctx, command, value, "subscription does not exist");
                ctx.send(SubscriptionCommand::CloseMessageSubscription(
                    CloseMessageSubscription {
                        subscription_partition_id: value.subscription_partition_id,
                        workflow_instance_key: value.workflow_instance_key,
                        element_instance_key,
                        message_name: value.message_name.clone(),
                    },
                ));
                return;
            }
        };
        if !self.can_trigger(ctx, element_instance_key) {
            self.refuse_correlation(ctx, command, value, "element can no longer be triggered");
            return;
        }
        let definition = ctx
            .state
            .elements
            .get(element_instance_key)
            .and_then(|e| self.repository.get(&e.value.bpmn_process_id));
        let Some(definition) = definition else {
            self.refuse_correlation(ctx, command, value, "process definition not found");
            return;
        };

        let mut correlated = subscription.clone();
        correlated.message_key = message_key;
        correlated.variables = value.variables.clone();
        ctx.write_event(
            element_instance_key,
            WorkflowInstanceSubscriptionIntent::Correlated,
            correlated,
        );
        ctx.send(correlate_ack(value));
        ctx.accept(element_instance_key);

        self.trigger_catch_event(
            ctx,
            &definition,
            element_instance_key,
            &subscription.handler_element_id,
            &value.variables,
        );
    }

    fn refuse_correlation(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &WorkflowInstanceSubscriptionRecord,
        reason: &str,
    ) {
        ctx.send(SubscriptionCommand::RejectCorrelateMessageSubscription(
            RejectCorrelateMessageSubscription {
                subscription_partition_id: value.subscription_partition_id,
                workflow_instance_key: value.workflow_instance_key,
                element_instance_key: value.element_instance_key,
                message_key: value.message_key,
                message_name: value.message_name.clone(),
                correlation_key: value.correlation_key.clone(),
            },
        ));
        ctx.reject(command, RejectionType::InvalidState, reason);
    }

    pub(super) fn acknowledge_close(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &WorkflowInstanceSubscriptionRecord,
    ) {
        let subscription = ctx
            .state
            .instance_subscriptions
            .get(value.element_instance_key, &value.message_name)
            .map(|s| s.record.clone());

        match subscription {
            Some(record) => {
                ctx.write_event(
                    value.element_instance_key,
                    WorkflowInstanceSubscriptionIntent::Closed,
                    record,
                );
                ctx.accept(value.element_instance_key);
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

    pub(super) fn trigger_timer(&self, ctx: &mut ProcessingContext<'_>, command: &Record) {
        let timer_key = command.key;
        let Some(timer) = ctx.state.timers.get(timer_key).cloned() else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!("no timer with key {}", timer_key),
            );
            return;
        };

        let scope_key = timer.element_instance_key;
        let definition = ctx
            .state
            .elements
            .get(scope_key)
            .and_then(|e| self.repository.get(&e.value.bpmn_process_id));
        let definition = match definition {
            Some(definition) if self.can_trigger(ctx, scope_key) => definition,
            _ => {
                ctx.write_event(timer_key, TimerIntent::Canceled, timer);
                ctx.reject(
                    command,
                    RejectionType::InvalidState,
                    format!("element {} can no longer be triggered", scope_key),
                );
                return;
            }
        };

        let handler_element_id = timer.handler_element_id.clone();
        ctx.write_event(timer_key, TimerIntent::Triggered, timer);
        ctx.accept(timer_key);
        debug!(partition_id = ctx.partition_id(), timer_key, "Timer fired");

        self.trigger_catch_event(
            ctx,
            &definition,
            scope_key,
            &handler_element_id,
            &Variables::new(),
        );
    }
}

fn correlate_ack(value: &WorkflowInstanceSubscriptionRecord) -> SubscriptionCommand {
    SubscriptionCommand::CorrelateMessageSubscription(CorrelateMessageSubscription {
        subscription_partition_id: value.subscription_partition_id,
        workflow_instance_key: value.workflow_instance_key,
        element_instance_key: value.element_instance_key,
        message_key: value.message_key,
        message_name: value.message_name.clone(),
    })
}
