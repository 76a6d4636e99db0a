use gatecore::record::{IncidentRecord, TimerRecord};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Timers {
    timers: BTreeMap<i64, TimerRecord>,
}

impl Timers {
    pub fn get(&self, key: i64) -> Option<&TimerRecord> {
        self.timers.get(&key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Keys of timers due at `now`, earliest first.
    pub fn due(&self, now: i64) -> Vec<i64> {
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, t)| t.due_date <= now)
            .map(|(key, t)| (t.due_date, *key))
            .collect();
        due.sort();
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub(crate) fn on_created(&mut self, key: i64, record: &TimerRecord) {
        self.timers.insert(key, record.clone());
    }

    pub(crate) fn on_removed(&mut self, key: i64) {
        self.timers.remove(&key);
    }
}

#[derive(Debug, Default)]
pub struct Incidents {
    incidents: BTreeMap<i64, IncidentRecord>,
}

impl Incidents {
    pub fn get(&self, key: i64) -> Option<&IncidentRecord> {
        self.incidents.get(&key)
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn for_element(&self, element_instance_key: i64) -> Vec<(i64, &IncidentRecord)> {
        self.incidents
            .iter()
            .filter(|(_, i)| i.element_instance_key == element_instance_key)
            .map(|(key, i)| (*key, i))
            .collect()
    }

    pub(crate) fn on_created(&mut self, key: i64, record: &IncidentRecord) {
        self.incidents.insert(key, record.clone());
    }

    pub(crate) fn on_resolved(&mut self, key: i64) {
        self.incidents.remove(&key);
    }
}
