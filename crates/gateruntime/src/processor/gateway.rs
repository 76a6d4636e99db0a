use super::{Engine, ProcessingContext};
use gatecore::record::{BpmnElementType, ErrorType, WorkflowInstanceIntent, WorkflowInstanceRecord};
use gatecore::{
    MappingKind, NodeSpec, PayloadMapping, ProcessDefinition, SequenceFlow, Value, Variables,
};
use tracing::{debug, warn};

impl Engine<'_> {
    pub(super) fn activate_gateway(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        key: i64,
        value: &WorkflowInstanceRecord,
    ) {
        let outgoing = definition.outgoing(&value.element_id);
        match value.element_type {
            BpmnElementType::ExclusiveGateway => {
                self.activate_exclusive_gateway(ctx, key, value, &outgoing)
            }
            BpmnElementType::ParallelGateway => self.complete_gateway(ctx, key, value, &outgoing),
            BpmnElementType::EventBasedGateway => {
                let catch_events: Vec<&NodeSpec> = outgoing
                    .iter()
                    .filter_map(|flow| definition.find_node(&flow.target))
                    .collect();
                self.subscribe(ctx, key, value, &catch_events);
            }
            _ => {}
        }
    }

    /// Take the first flow whose condition holds, in declaration order, or
    /// the default flow. No match and no default is an incident.
    fn activate_exclusive_gateway(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
        outgoing: &[&SequenceFlow],
    ) {
        if outgoing.is_empty() {
            self.complete_gateway(ctx, key, value, &[]);
            return;
        }

        for flow in outgoing.iter().filter(|f| !f.is_default) {
            let taken = match &flow.condition {
                None => Ok(true),
                Some(condition) => self.evaluator.evaluate_condition(condition, &value.variables),
            };
            match taken {
                Ok(true) => {
                    self.complete_gateway(ctx, key, value, &[*flow]);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    self.raise_incident(ctx, key, value, ErrorType::ConditionError, e.to_string());
                    return;
                }
            }
        }

        match outgoing.iter().find(|f| f.is_default) {
            Some(default) => self.complete_gateway(ctx, key, value, &[*default]),
            None => self.raise_incident(
                ctx,
                key,
                value,
                ErrorType::ConditionError,
                format!(
                    "no condition of gateway '{}' matched and it has no default flow",
                    value.element_id
                ),
            ),
        }
    }

    pub(super) fn complete_gateway(
        &self,
        ctx: &mut ProcessingContext<'_>,
        key: i64,
        value: &WorkflowInstanceRecord,
        flows: &[&SequenceFlow],
    ) {
        ctx.write_event(key, WorkflowInstanceIntent::ElementCompleting, value.clone());
        ctx.write_event(key, WorkflowInstanceIntent::ElementCompleted, value.clone());
        self.take_flows(ctx, value, flows);
    }

    /// Queue an arrival at a joining parallel gateway and activate the
    /// gateway once every incoming flow has one.
    pub(super) fn on_join_arrival(
        &self,
        ctx: &mut ProcessingContext<'_>,
        definition: &ProcessDefinition,
        join: &NodeSpec,
        value: &WorkflowInstanceRecord,
    ) {
        let incoming = definition.incoming(&join.id);
        let scope_key = value.flow_scope_key;

        let branches: Option<Vec<(&SequenceFlow, Variables)>> = ctx
            .state
            .elements
            .arrivals(scope_key, &join.id)
            .and_then(|queues| {
                incoming
                    .iter()
                    .map(|flow| {
                        queues
                            .get(&flow.id)
                            .and_then(|queue| queue.front())
                            .map(|payload| (*flow, payload.clone()))
                    })
                    .collect()
            });

        let Some(branches) = branches else {
            debug!(
                partition_id = ctx.partition_id(),
                join = %join.id,
                flow = %value.element_id,
                "Waiting for remaining flows at join"
            );
            return;
        };

        let mut activating = WorkflowInstanceRecord::new(
            &value.bpmn_process_id,
            value.workflow_instance_key,
            scope_key,
            &join.id,
            join.kind.into(),
        )
        .with_variables(self.merge_branches(&branches));
        activating.consumed_flows = incoming.iter().map(|flow| flow.id.clone()).collect();

        let key = ctx.next_key();
        ctx.write_event(key, WorkflowInstanceIntent::ElementActivating, activating);
    }

    /// Merge branch payloads in declared flow order. A flow without mappings
    /// contributes its whole payload, later flows overwriting earlier ones.
    fn merge_branches(&self, branches: &[(&SequenceFlow, Variables)]) -> Variables {
        let mut merged = Variables::new();
        for (flow, payload) in branches {
            if flow.payload_mappings.is_empty() {
                merged.extend(payload.clone());
                continue;
            }

            for mapping in &flow.payload_mappings {
                match self.evaluator.evaluate(&mapping.source, payload) {
                    Ok(value) => apply_mapping(&mut merged, mapping, value),
                    Err(e) => warn!(
                        flow = %flow.id,
                        source = %mapping.source,
                        error = %e,
                        "Skipping payload mapping"
                    ),
                }
            }
        }
        merged
    }
}

fn apply_mapping(merged: &mut Variables, mapping: &PayloadMapping, value: Value) {
    match mapping.kind {
        MappingKind::Put => {
            merged.insert(mapping.target.clone(), value);
        }
        MappingKind::Collect => {
            let slot = merged
                .entry(mapping.target.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => items.push(value),
                other => {
                    let previous = std::mem::replace(other, Value::Null);
                    *other = Value::Array(vec![previous, value]);
                }
            }
        }
    }
}
