//! Partitioned BPMN engine runtime
//!
//! Each partition owns an append-only log and the state derived from it.
//! Workflow instances live on the partition that created them; messages
//! and message subscriptions live on the partition owning their
//! correlation key. The two sides keep each other in sync through
//! subscription commands that are resent until acknowledged.

pub mod broker;
pub mod clock;
pub mod config;
pub mod evaluator;
pub mod log;
pub mod partition;
pub mod processor;
pub mod registry;
pub mod state;
pub mod transport;

pub use broker::{Broker, PublishMessage};
pub use clock::{Clock, ControlledClock, SystemClock};
pub use config::RuntimeConfig;
pub use evaluator::{EvalexprEvaluator, ExpressionEvaluator};
pub use log::{FileLogStorage, LogStorage, LogStream, MemoryLogStorage};
pub use processor::{CommandResponse, StreamProcessor};
pub use registry::ProcessRepository;
pub use transport::{
    ChannelTransport, PartitionTransport, SubscriptionCommandHandler, SubscriptionCommandSender,
};
