use crate::processor::StreamProcessor;
use crate::transport::SubscriptionCommandHandler;
use bytes::Bytes;
use gatecore::{Record, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A client command for one partition and where to send the outcome
pub struct PartitionRequest {
    pub command: Record,
    pub reply: oneshot::Sender<Result<i64>>,
}

/// Single-writer task owning one partition's processor.
///
/// Client requests, inbound subscription commands and the periodic sweep
/// are all handled on this task, one at a time.
pub struct Partition {
    processor: StreamProcessor,
    requests: mpsc::Receiver<PartitionRequest>,
    inbound: mpsc::Receiver<Bytes>,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

impl Partition {
    pub fn new(
        processor: StreamProcessor,
        requests: mpsc::Receiver<PartitionRequest>,
        inbound: mpsc::Receiver<Bytes>,
        sweep_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            processor,
            requests,
            inbound,
            sweep_interval,
            cancel,
        }
    }

    /// Run until cancelled or until the log fails.
    pub async fn run(mut self) {
        let partition_id = self.processor.partition_id();
        info!(partition_id, "Partition started");

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(request) = self.requests.recv() => {
                    match self.processor.process_command(request.command) {
                        Ok(response) => {
                            let _ = request.reply.send(response.into_result());
                            Ok(())
                        }
                        Err(e) => {
                            let message = e.to_string();
                            let _ = request.reply.send(Err(e));
                            Err(message)
                        }
                    }
                }
                Some(payload) = self.inbound.recv() => {
                    match SubscriptionCommandHandler::handle(&payload) {
                        Some(command) => self
                            .processor
                            .process_command(command)
                            .map(|_| ())
                            .map_err(|e| e.to_string()),
                        None => Ok(()),
                    }
                }
                _ = sweep.tick() => self.processor.run_sweeps().map_err(|e| e.to_string()),
            };

            if let Err(message) = outcome {
                error!(partition_id, error = %message, "Partition log failed, stopping");
                break;
            }
        }

        info!(partition_id, "Partition stopped");
    }
}
