use super::{Engine, ProcessingContext};
use crate::state::ElementState;
use gatecore::record::{
    BpmnElementType, ErrorType, IncidentIntent, IncidentRecord, WorkflowInstanceIntent,
    WorkflowInstanceRecord,
};
use gatecore::{
    Intent, NodeKind, ProcessDefinition, Record, RejectionType, SequenceFlow, Variables,
};
use tracing::{info, warn};

impl Engine<'_> {
    pub(super) fn create_instance(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &WorkflowInstanceRecord,
    ) {
        let Some(definition) = self.repository.get(&value.bpmn_process_id) else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!("no process deployed with id '{}'", value.bpmn_process_id),
            );
            return;
        };

        let key = ctx.next_key();
        let process = WorkflowInstanceRecord::new(
            &definition.bpmn_process_id,
            key,
            -1,
            &definition.bpmn_process_id,
            BpmnElementType::Process,
        )
        .with_variables(value.variables.clone());

        ctx.write_event(key, WorkflowInstanceIntent::ElementActivating, process);
        ctx.accept(key);
        info!(
            partition_id = ctx.partition_id(),
            workflow_instance_key = key,
            bpmn_process_id = %definition.bpmn_process_id,
            "Created workflow instance"
        );
    }

    /// Terminate every live element of an instance, then the instance.
    ///
    /// Cancelling an instance that is already gone is rejected, but closes
    /// that are still unacknowledged are sent again.
    pub(super) fn cancel_instance(&self, ctx: &mut ProcessingContext<'_>, command: &Record) {
        let workflow_instance_key = command.key;
        let process = ctx
            .state
            .elements
            .get(workflow_instance_key)
            .filter(|e| e.value.element_type == BpmnElementType::Process && e.is_active())
            .map(|e| e.value.clone());

        match process {
            Some(value) => {
                ctx.write_event(
                    workflow_instance_key,
                    WorkflowInstanceIntent::ElementTerminating,
                    value,
                );
                ctx.accept(workflow_instance_key);
            }
            None => {
                self.resend_pending_closes(ctx, workflow_instance_key);
                ctx.reject(
                    command,
                    RejectionType::NotFound,
                    format!("no active workflow instance with key {}", workflow_instance_key),
                );
            }
        }
    }

    pub(super) fn resolve_incident(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &Record,
        value: &IncidentRecord,
    ) {
        let incident_key = command.key;
        let Some(mut incident) = ctx.state.incidents.get(incident_key).cloned() else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!("no incident with key {}", incident_key),
            );
            return;
        };

        incident.variables = value.variables.clone();
        let element_instance_key = incident.element_instance_key;
        ctx.write_event(incident_key, IncidentIntent::Resolved, incident);
        ctx.accept(incident_key);

        let Some(element) = ctx
            .state
            .elements
            .get(element_instance_key)
            .filter(|e| e.is_active())
            .map(|e| e.value.clone())
        else {
            return;
        };

        // Re-activating the element runs the step that failed again.
        let mut retry = element;
        retry.variables.extend(value.variables.clone());
        let intent = if retry.element_type.is_gateway() {
            WorkflowInstanceIntent::GatewayActivated
        } else {
            WorkflowInstanceIntent::ElementActivated
        };
        ctx.write_event(element_instance_key, intent, retry);
    }

    /// React to an event written in the current step.
    pub(super) fn react(&self, ctx: &mut ProcessingContext<'_>, event: &Record) {
        let (Intent::WorkflowInstance(intent), Some(value)) =
            (event.intent, event.workflow_instance())
        else {
            return;
        };
        let Some(definition) = self.repository.get(&value.bpmn_process_id) else {
            warn!(
                bpmn_process_id = %value.bpmn_process_id,
                "Process definition disappeared, instance is stuck"
            );
            return;
        };

        let key = event.key;
        match intent {
            WorkflowInstanceIntent::ElementActivating => self.on_activating(ctx, key, value),
            WorkflowInstanceIntent::ElementActivated => {
                self.on_activated(ctx, &definition, key, value)
            }
            WorkflowInstanceIntent::GatewayActivated => {
                if self.is_in_state(ctx, key, ElementState::Activated) {
                    self.activate_gateway(ctx, &definition, key, value)
                }
            }
            WorkflowInstanceIntent::ElementCompleting if !value.element_type.is_gateway() => {
                if self.is_in_state(ctx, key, ElementState::Completing) {
                    ctx.write_event(key, WorkflowInstanceIntent::ElementCompleted, value.clone());
                }
            }
            WorkflowInstanceIntent::ElementCompleted => self.on_completed(ctx, &definition, value),
            WorkflowInstanceIntent::SequenceFlowTaken => {
                self.on_flow_taken(ctx, &definition, value)
            }
            WorkflowInstanceIntent::ElementTerminating => self.on_terminating(ctx, key, value),
            WorkflowInstanceIntent::ElementTerminated => self.on_terminated(ctx, value),
            _ => {}
        }
    }

    fn is_in_state(&self, ctx: &ProcessingContext<'_>, key: i64, state: ElementState) -> bool {
        ctx.state
            .elements
            .get(key)
            .map_or(false, |e| e.state == state)
    }

    fn on_activating(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        if !self.is_in_state(ctx, key, ElementState::Activating) {
            return;
        }
        let intent = if value.element_type.is_gateway() {
            WorkflowInstanceIntent::GatewayActivated
        } else {
            WorkflowInstanceIntent::ElementActivated
        };
        ctx.write_event(key, intent, value.clone());
    }

    fn on_activated(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        if !self.is_in_state(ctx, key, ElementState::Activated) {
            return;
        }

        match value.element_type {
            BpmnElementType::Process => {
                let Some(start) = definition.start_node() else {
                    return;
                };
                let child_key = ctx.next_key();
                let child = WorkflowInstanceRecord::new(
                    &value.bpmn_process_id,
                    value.workflow_instance_key,
                    key,
                    &start.id,
                    start.kind.into(),
                )
                .with_variables(value.variables.clone());
                ctx.write_event(child_key, WorkflowInstanceIntent::ElementActivating, child);
            }
            BpmnElementType::Task => {
                let mut completing = value.clone();
                if let Some(node) = definition.find_node(&value.element_id) {
                    completing.variables.extend(node.outputs.clone());
                }
                ctx.write_event(key, WorkflowInstanceIntent::ElementCompleting, completing);
            }
            BpmnElementType::IntermediateCatchEvent => {
                if self.entered_from_event_based_gateway(definition, value) {
                    ctx.write_event(key, WorkflowInstanceIntent::ElementCompleting, value.clone());
                } else if let Some(node) = definition.find_node(&value.element_id) {
                    self.subscribe(ctx, key, value, &[node]);
                }
            }
            BpmnElementType::StartEvent | BpmnElementType::EndEvent => {
                ctx.write_event(key, WorkflowInstanceIntent::ElementCompleting, value.clone());
            }
            _ => {}
        }
    }

    /// A catch event behind an event-based gateway was already triggered by
    /// the gateway; it completes right away.
    fn entered_from_event_based_gateway(
        &self,
        definition: &ProcessDefinition,
        value: &WorkflowInstanceRecord,
    ) -> bool {
        value
            .consumed_flows
            .first()
            .and_then(|flow| definition.find_flow(flow))
            .and_then(|flow| definition.find_node(&flow.source))
            .map_or(false, |source| source.kind == NodeKind::EventBasedGateway)
    }

    fn on_completed(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        value: &WorkflowInstanceRecord,
    ) {
        match value.element_type {
            BpmnElementType::Process => {
                info!(
                    partition_id = ctx.partition_id(),
                    workflow_instance_key = value.workflow_instance_key,
                    "Workflow instance completed"
                );
            }
            // gateways take their flows while completing
            element_type if element_type.is_gateway() => {}
            _ => {
                let outgoing = definition.outgoing(&value.element_id);
                self.take_flows(ctx, value, &outgoing);
            }
        }
    }

    /// Take the given flows out of a completed element. Without any flow the
    /// token ends here and the scope may be done.
    pub(super) fn take_flows(
        &self,
        ctx: &mut ProcessingContext<'_>,
        value: &WorkflowInstanceRecord,
        flows: &[&SequenceFlow],
    ) {
        if flows.is_empty() {
            self.complete_scope_if_idle(ctx, value.flow_scope_key, &value.variables);
            return;
        }

        for flow in flows {
            let mut taken = WorkflowInstanceRecord::new(
                &value.bpmn_process_id,
                value.workflow_instance_key,
                value.flow_scope_key,
                &flow.id,
                BpmnElementType::SequenceFlow,
            )
            .with_variables(value.variables.clone());
            taken.target_element_id = Some(flow.target.clone());

            let key = ctx.next_key();
            ctx.write_event(key, WorkflowInstanceIntent::SequenceFlowTaken, taken);
        }
    }

    fn complete_scope_if_idle(
        &self,
        ctx: &mut ProcessingContext<'_>,
        scope_key: i64,
        variables: &Variables,
    ) {
        if !ctx.state.elements.is_scope_idle(scope_key) {
            return;
        }
        let Some(mut scope) = ctx
            .state
            .elements
            .get(scope_key)
            .filter(|e| e.is_active())
            .map(|e| e.value.clone())
        else {
            return;
        };

        scope.variables = variables.clone();
        ctx.write_event(scope_key, WorkflowInstanceIntent::ElementCompleting, scope);
    }

    fn on_flow_taken(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        value: &WorkflowInstanceRecord,
    ) {
        let scope_active = ctx
            .state
            .elements
            .get(value.flow_scope_key)
            .map_or(false, |scope| scope.is_active());
        if !scope_active {
            return;
        }
        let Some(target) = value
            .target_element_id
            .as_deref()
            .and_then(|id| definition.find_node(id))
        else {
            return;
        };

        if definition.is_join(&target.id) {
            self.on_join_arrival(ctx, definition, target, value);
            return;
        }

        let mut next = WorkflowInstanceRecord::new(
            &value.bpmn_process_id,
            value.workflow_instance_key,
            value.flow_scope_key,
            &target.id,
            target.kind.into(),
        )
        .with_variables(value.variables.clone());
        next.consumed_flows = vec![value.element_id.clone()];

        let key = ctx.next_key();
        ctx.write_event(key, WorkflowInstanceIntent::ElementActivating, next);
    }

    fn on_terminating(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        if !self.is_in_state(ctx, key, ElementState::Terminating) {
            return;
        }

        let children = ctx.state.elements.children(key);
        if children.is_empty() {
            self.finish_termination(ctx, key, value);
            return;
        }

        for child_key in children {
            let Some(child) = ctx.state.elements.get(child_key).map(|e| e.value.clone()) else {
                continue;
            };
            ctx.write_event(child_key, WorkflowInstanceIntent::ElementTerminating, child);
        }
    }

    fn on_terminated(&self, ctx: &mut ProcessingContext<'_>, value: &WorkflowInstanceRecord) {
        if value.element_type == BpmnElementType::Process {
            info!(
                partition_id = ctx.partition_id(),
                workflow_instance_key = value.workflow_instance_key,
                "Workflow instance terminated"
            );
            return;
        }

        let scope_key = value.flow_scope_key;
        if !self.is_in_state(ctx, scope_key, ElementState::Terminating)
            || !ctx.state.elements.children(scope_key).is_empty()
        {
            return;
        }
        if let Some(scope) = ctx.state.elements.get(scope_key).map(|e| e.value.clone()) {
            self.finish_termination(ctx, scope_key, &scope);
        }
    }

    fn finish_termination(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        self.unsubscribe(ctx, key);

        let incidents: Vec<_> = ctx
            .state
            .incidents
            .for_element(key)
            .into_iter()
            .map(|(incident_key, incident)| (incident_key, incident.clone()))
            .collect();
        for (incident_key, incident) in incidents {
            ctx.write_event(incident_key, IncidentIntent::Resolved, incident);
        }

        ctx.write_event(key, WorkflowInstanceIntent::ElementTerminated, value.clone());
    }

    pub(super) fn raise_incident(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
        error_type: ErrorType,
        error_message: String,
    ) {
        warn!(
            partition_id = ctx.partition_id(),
            element_instance_key = key,
            element_id = %value.element_id,
            ?error_type,
            %error_message,
            "Raising incident"
        );

        let incident = IncidentRecord {
            error_type,
            error_message,
            bpmn_process_id: value.bpmn_process_id.clone(),
            workflow_instance_key: value.workflow_instance_key,
            element_instance_key: key,
            element_id: value.element_id.clone(),
            variables: value.variables.clone(),
        };
        let incident_key = ctx.next_key();
        ctx.write_event(incident_key, IncidentIntent::Created, incident);
    }
}
