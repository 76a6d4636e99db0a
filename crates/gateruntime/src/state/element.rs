use gatecore::record::WorkflowInstanceRecord;
use gatecore::Variables;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Activating,
    Activated,
    Completing,
    Terminating,
}

/// A live token
#[derive(Debug, Clone)]
pub struct ElementInstance {
    pub key: i64,
    pub state: ElementState,
    pub value: WorkflowInstanceRecord,
}

impl ElementInstance {
    pub fn is_active(&self) -> bool {
        self.state == ElementState::Activated
    }
}

/// Something an event scope waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchHandle {
    Message { message_name: String },
    Timer { timer_key: i64 },
}

/// Catch events sharing one element instance as their handler scope.
/// Only the first trigger resolves the scope.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub resolved: bool,
    /// Catch element id to what it waits for.
    pub handlers: BTreeMap<String, CatchHandle>,
}

/// Branch payloads queued per incoming flow id.
pub type ArrivalQueues = BTreeMap<String, VecDeque<Variables>>;

#[derive(Debug, Default)]
pub struct ElementInstances {
    instances: BTreeMap<i64, ElementInstance>,
    children: BTreeMap<i64, BTreeSet<i64>>,
    arrivals: BTreeMap<(i64, String), ArrivalQueues>,
    event_scopes: BTreeMap<i64, EventScope>,
}

impl ElementInstances {
    pub fn get(&self, key: i64) -> Option<&ElementInstance> {
        self.instances.get(&key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Live children of a scope, oldest first.
    pub fn children(&self, scope_key: i64) -> Vec<i64> {
        self.children
            .get(&scope_key)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn arrivals(&self, scope_key: i64, element_id: &str) -> Option<&ArrivalQueues> {
        self.arrivals.get(&(scope_key, element_id.to_string()))
    }

    /// No live child and no token waiting at a join.
    pub fn is_scope_idle(&self, scope_key: i64) -> bool {
        let no_children = self
            .children
            .get(&scope_key)
            .map_or(true, |children| children.is_empty());
        let no_arrivals = !self
            .arrivals
            .iter()
            .any(|((scope, _), queues)| {
                *scope == scope_key && queues.values().any(|q| !q.is_empty())
            });
        no_children && no_arrivals
    }

    pub fn event_scope(&self, key: i64) -> Option<&EventScope> {
        self.event_scopes.get(&key)
    }

    pub(crate) fn on_activating(&mut self, key: i64, value: &WorkflowInstanceRecord) {
        let scope_key = value.flow_scope_key;
        self.instances.insert(
            key,
            ElementInstance {
                key,
                state: ElementState::Activating,
                value: value.clone(),
            },
        );

        if scope_key >= 0 {
            self.children.entry(scope_key).or_default().insert(key);
        }

        let arrival_key = (scope_key, value.element_id.clone());
        if let Some(queues) = self.arrivals.get_mut(&arrival_key) {
            for flow in &value.consumed_flows {
                if let Some(queue) = queues.get_mut(flow) {
                    queue.pop_front();
                    if queue.is_empty() {
                        queues.remove(flow);
                    }
                }
            }
            if queues.is_empty() {
                self.arrivals.remove(&arrival_key);
            }
        }
    }

    pub(crate) fn on_state(&mut self, key: i64, state: ElementState, variables: &Variables) {
        if let Some(instance) = self.instances.get_mut(&key) {
            instance.state = state;
            instance.value.variables = variables.clone();
        }
    }

    pub(crate) fn on_removed(&mut self, key: i64) {
        let Some(instance) = self.instances.remove(&key) else {
            return;
        };

        let scope_key = instance.value.flow_scope_key;
        if let Some(siblings) = self.children.get_mut(&scope_key) {
            siblings.remove(&key);
            if siblings.is_empty() {
                self.children.remove(&scope_key);
            }
        }

        self.children.remove(&key);
        self.event_scopes.remove(&key);
        self.arrivals.retain(|(scope, _), _| *scope != key);
    }

    pub(crate) fn on_flow_taken(&mut self, value: &WorkflowInstanceRecord) {
        let Some(target) = &value.target_element_id else {
            return;
        };
        self.arrivals
            .entry((value.flow_scope_key, target.clone()))
            .or_default()
            .entry(value.element_id.clone())
            .or_default()
            .push_back(value.variables.clone());
    }

    pub(crate) fn register_handler(
        &mut self,
        scope_key: i64,
        element_id: &str,
        handle: CatchHandle,
    ) {
        self.event_scopes
            .entry(scope_key)
            .or_default()
            .handlers
            .insert(element_id.to_string(), handle);
    }

    pub(crate) fn on_triggering(&mut self, scope_key: i64) {
        self.event_scopes.entry(scope_key).or_default().resolved = true;
    }

    pub(crate) fn on_triggered(&mut self, scope_key: i64, variables: &Variables) {
        if let Some(instance) = self.instances.get_mut(&scope_key) {
            instance.value.variables = variables.clone();
        }
    }
}
