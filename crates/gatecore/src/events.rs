use crate::record::Record;
use tokio::sync::broadcast;

/// Broadcasts every record a partition commits, for exporters and read
/// models. Slow receivers lag and miss records; they never block a
/// partition.
#[derive(Clone)]
pub struct RecordBus {
    sender: broadcast::Sender<Record>,
}

impl RecordBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Record> {
        self.sender.subscribe()
    }

    pub fn emit(&self, record: Record) {
        let _ = self.sender.send(record);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RecordBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
