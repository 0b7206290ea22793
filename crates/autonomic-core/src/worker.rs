//! Worker pool
//!
//! N tasks per stage topic pull deliveries and hand them to the coordinator.
//! Acks, nacks and abandonment are decided here from the coordinator's
//! [`Disposition`].

use crate::channel::{Channel, Delivery};
use crate::coordinator::{Disposition, LoopCoordinator};
use crate::types::Stage;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Running set of stage workers
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers_per_stage` tasks for each stage
    #[must_use]
    pub fn spawn(coordinator: Arc<LoopCoordinator>) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let per_stage = coordinator.config().workers_per_stage;
        let mut handles = Vec::with_capacity(per_stage * Stage::ALL.len());
        for stage in Stage::ALL {
            for index in 0..per_stage {
                handles.push(tokio::spawn(run_worker(
                    stage,
                    index,
                    Arc::clone(&coordinator),
                    signal.clone(),
                )));
            }
        }
        info!(workers = handles.len(), "worker pool started");
        Self { shutdown, handles }
    }

    /// Number of worker tasks
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker to stop after its current job and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    stage: Stage,
    index: usize,
    coordinator: Arc<LoopCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let channel = Arc::clone(coordinator.channel());
    let topic = coordinator.config().topics.for_stage(stage).to_string();
    let mut deliveries = channel.subscribe(&topic);
    debug!(%stage, index, topic = %topic, "worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = deliveries.next() => match next {
                Some(delivery) => process(&coordinator, channel.as_ref(), delivery).await,
                None => break,
            },
        }
    }
    debug!(%stage, index, "worker stopped");
}

/// Handle one delivery and settle it with the channel
pub async fn process(coordinator: &LoopCoordinator, channel: &dyn Channel, delivery: Delivery) {
    let job = &delivery.envelope;
    let span = info_span!(
        "job",
        job_id = %job.job_id,
        episode_id = ?job.episode_id,
        agent_id = %job.agent_id,
        stage = %job.kind(),
        delivery = delivery.delivery_attempt,
    );

    async {
        let max_deliveries = coordinator.config().max_deliveries;
        let settled = match coordinator.handle(job).await {
            Ok(Disposition::Ack(reason)) => {
                debug!(%reason, "job done");
                channel.ack(&delivery).await
            }
            Ok(Disposition::Retry(err)) if delivery.delivery_attempt < max_deliveries => {
                debug!(error = %err, "nacking for redelivery");
                channel.nack(&delivery).await
            }
            Ok(Disposition::Retry(err)) | Err(err) => {
                coordinator.abandon(job, &err);
                channel.ack(&delivery).await
            }
        };
        if let Err(e) = settled {
            // lease already expired; the job will be seen again
            warn!(error = %e, "could not settle delivery");
        }
    }
    .instrument(span)
    .await;
}
