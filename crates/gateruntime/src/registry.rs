use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gatecore::{DefinitionError, ProcessDefinition};
use std::sync::Arc;

/// Deployed process definitions, shared by every partition.
///
/// Definitions are validated on deployment and immutable afterwards.
/// Running instances look their definition up by id, so an id can only be
/// redeployed with an identical definition.
pub struct ProcessRepository {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl ProcessRepository {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
        }
    }

    /// Validate and register a definition
    pub fn deploy(
        &self,
        definition: ProcessDefinition,
    ) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        definition.validate()?;

        match self.definitions.entry(definition.bpmn_process_id.clone()) {
            Entry::Occupied(existing) if **existing.get() == definition => {
                Ok(existing.get().clone())
            }
            Entry::Occupied(_) => Err(DefinitionError::DuplicateId(definition.bpmn_process_id)),
            Entry::Vacant(slot) => {
                let definition = Arc::new(definition);
                slot.insert(definition.clone());
                tracing::info!(bpmn_process_id = %definition.bpmn_process_id, "Deployed process");
                Ok(definition)
            }
        }
    }

    pub fn get(&self, bpmn_process_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions
            .get(bpmn_process_id)
            .map(|definition| definition.value().clone())
    }

    pub fn list_process_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .definitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Default for ProcessRepository {
    fn default() -> Self {
        Self::new()
    }
}
