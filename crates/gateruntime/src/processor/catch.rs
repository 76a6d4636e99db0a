use super::{Engine, ProcessingContext};
use crate::state::{CatchHandle, WorkflowInstanceSubscriptionState};
use gatecore::codec::{CloseMessageSubscription, OpenMessageSubscription, SubscriptionCommand};
use gatecore::record::{
    BpmnElementType, ErrorType, TimerIntent, TimerRecord, WorkflowInstanceIntent,
    WorkflowInstanceRecord, WorkflowInstanceSubscriptionIntent, WorkflowInstanceSubscriptionRecord,
};
use gatecore::{
    subscription_partition_id, CatchEventDefinition, NodeSpec, ProcessDefinition, SequenceFlow,
    Value, Variables,
};
use tracing::debug;

enum Subscription {
    Message {
        handler_element_id: String,
        message_name: String,
        correlation_key: String,
    },
    Timer {
        handler_element_id: String,
        duration_ms: u64,
    },
}

impl Engine<'_> {
    /// Open a subscription or timer for each catch event, with `key` as the
    /// event scope. Correlation keys are all extracted before anything is
    /// opened, so a failure leaves nothing half subscribed.
    pub(super) fn subscribe(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
        catch_events: &[&NodeSpec],
    ) {
        let mut subscriptions = Vec::with_capacity(catch_events.len());
        for node in catch_events {
            match &node.catch_event {
                Some(CatchEventDefinition::Message {
                    name,
                    correlation_key,
                }) => match self.extract_correlation_key(correlation_key, &value.variables) {
                    Ok(correlation_key) => subscriptions.push(Subscription::Message {
                        handler_element_id: node.id.clone(),
                        message_name: name.clone(),
                        correlation_key,
                    }),
                    Err(message) => {
                        self.raise_incident(ctx, key, value, ErrorType::ExtractValueError, message);
                        return;
                    }
                },
                Some(CatchEventDefinition::Timer { duration_ms }) => {
                    subscriptions.push(Subscription::Timer {
                        handler_element_id: node.id.clone(),
                        duration_ms: *duration_ms,
                    })
                }
                None => {}
            }
        }

        for subscription in subscriptions {
            match subscription {
                Subscription::Message {
                    handler_element_id,
                    message_name,
                    correlation_key,
                } => {
                    let subscription_partition_id =
                        subscription_partition_id(&correlation_key, self.partition_count);
                    let record = WorkflowInstanceSubscriptionRecord {
                        subscription_partition_id,
                        workflow_instance_key: value.workflow_instance_key,
                        element_instance_key: key,
                        message_name: message_name.clone(),
                        correlation_key: correlation_key.clone(),
                        message_key: -1,
                        close_on_correlate: true,
                        variables: Variables::new(),
                        handler_element_id,
                    };
                    ctx.write_event(key, WorkflowInstanceSubscriptionIntent::Opening, record);
                    ctx.send(SubscriptionCommand::OpenMessageSubscription(
                        OpenMessageSubscription {
                            subscription_partition_id,
                            workflow_instance_key: value.workflow_instance_key,
                            element_instance_key: key,
                            close_on_correlate: true,
                            message_name,
                            correlation_key,
                        },
                    ));
                }
                Subscription::Timer {
                    handler_element_id,
                    duration_ms,
                } => {
                    let timer = TimerRecord {
                        workflow_instance_key: value.workflow_instance_key,
                        element_instance_key: key,
                        handler_element_id,
                        due_date: ctx
                            .now()
                            .saturating_add(i64::try_from(duration_ms).unwrap_or(i64::MAX)),
                    };
                    let timer_key = ctx.next_key();
                    ctx.write_event(timer_key, TimerIntent::Created, timer);
                }
            }
        }
    }

    fn extract_correlation_key(
        &self,
        expression: &str,
        variables: &Variables,
    ) -> Result<String, String> {
        match self.evaluator.evaluate(expression, variables) {
            Ok(Value::String(key)) => Ok(key),
            Ok(Value::Number(n)) if n.fract() == 0.0 => Ok(format!("{}", n as i64)),
            Ok(other) => Err(format!(
                "correlation key '{}' must be a string or an integer, got {:?}",
                expression, other
            )),
            Err(e) => Err(format!("failed to extract correlation key: {}", e)),
        }
    }

    /// Resolve the event scope `scope_key` through `handler_element_id`.
    ///
    /// Only the first trigger of a scope wins; the other handlers of the
    /// scope are cancelled before the scope continues with `payload`
    /// merged into its variables. Returns whether the trigger was taken.
    pub(super) fn trigger_catch_event(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        scope_key: i64,
        handler_element_id: &str,
        payload: &Variables,
    ) -> bool {
        if !self.can_trigger(ctx, scope_key) {
            return false;
        }
        let Some(scope) = ctx.state.elements.get(scope_key).map(|e| e.value.clone()) else {
            return false;
        };
        let siblings: Vec<CatchHandle> = ctx
            .state
            .elements
            .event_scope(scope_key)
            .map(|s| {
                s.handlers
                    .iter()
                    .filter(|(id, _)| id.as_str() != handler_element_id)
                    .map(|(_, handle)| handle.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut triggering = scope.clone();
        triggering.handler_element_id = Some(handler_element_id.to_string());
        triggering.variables = payload.clone();
        ctx.write_event(scope_key, WorkflowInstanceIntent::CatchEventTriggering, triggering);

        for handle in &siblings {
            handle.cancel(ctx, scope_key);
        }

        let mut triggered = scope;
        triggered.variables.extend(payload.clone());
        triggered.handler_element_id = Some(handler_element_id.to_string());
        ctx.write_event(
            scope_key,
            WorkflowInstanceIntent::CatchEventTriggered,
            triggered.clone(),
        );

        triggered.handler_element_id = None;
        if triggered.element_type == BpmnElementType::EventBasedGateway {
            let flows: Vec<&SequenceFlow> = definition
                .outgoing(&triggered.element_id)
                .into_iter()
                .filter(|flow| flow.target == handler_element_id)
                .take(1)
                .collect();
            self.complete_gateway(ctx, scope_key, &triggered, &flows);
        } else {
            ctx.write_event(scope_key, WorkflowInstanceIntent::ElementCompleting, triggered);
        }

        debug!(
            partition_id = ctx.partition_id(),
            scope_key,
            handler_element_id,
            "Triggered catch event"
        );
        true
    }

    /// The scope element is waiting and no sibling has won yet.
    pub(super) fn can_trigger(&self, ctx: &ProcessingContext<'_>, scope_key: i64) -> bool {
        let active = ctx
            .state
            .elements
            .get(scope_key)
            .map_or(false, |e| e.is_active());
        let unresolved = ctx
            .state
            .elements
            .event_scope(scope_key)
            .map_or(false, |s| !s.resolved);
        active && unresolved
    }

    /// Cancel every handler of an event scope.
    pub(super) fn unsubscribe(&self, ctx: &mut ProcessingContext<'_>, scope_key: i64) {
        let handles: Vec<CatchHandle> = ctx
            .state
            .elements
            .event_scope(scope_key)
            .map(|s| s.handlers.values().cloned().collect())
            .unwrap_or_default();
        for handle in &handles {
            handle.cancel(ctx, scope_key);
        }
    }

    pub(super) fn resend_pending_closes(
        &self,
        ctx: &mut ProcessingContext<'_>,
        workflow_instance_key: i64,
    ) {
        let closing: Vec<WorkflowInstanceSubscriptionRecord> = ctx
            .state
            .instance_subscriptions
            .for_workflow_instance(workflow_instance_key)
            .into_iter()
            .filter(|s| s.state == WorkflowInstanceSubscriptionState::Closing)
            .map(|s| s.record.clone())
            .collect();
        for record in closing {
            ctx.send(close_message_subscription(&record));
        }
    }
}

impl CatchHandle {
    pub(crate) fn cancel(&self, ctx: &mut ProcessingContext<'_>, scope_key: i64) {
        match self {
            CatchHandle::Message { message_name } => {
                let record = match ctx.state.instance_subscriptions.get(scope_key, message_name) {
                    Some(s) if s.state != WorkflowInstanceSubscriptionState::Closing => {
                        s.record.clone()
                    }
                    _ => return,
                };
                ctx.write_event(
                    scope_key,
                    WorkflowInstanceSubscriptionIntent::Closing,
                    record.clone(),
                );
                ctx.send(close_message_subscription(&record));
            }
            CatchHandle::Timer { timer_key } => {
                let Some(timer) = ctx.state.timers.get(*timer_key).cloned() else {
                    return;
                };
                ctx.write_event(*timer_key, TimerIntent::Canceled, timer);
            }
        }
    }
}

fn close_message_subscription(record: &WorkflowInstanceSubscriptionRecord) -> SubscriptionCommand {
    SubscriptionCommand::CloseMessageSubscription(CloseMessageSubscription {
        subscription_partition_id: record.subscription_partition_id,
        workflow_instance_key: record.workflow_instance_key,
        element_instance_key: record.element_instance_key,
        message_name: record.message_name.clone(),
    })
}
