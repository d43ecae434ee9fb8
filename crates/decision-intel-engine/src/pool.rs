use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{AnalysisTrigger, DecisionEngine, Recommendation};
use crate::telemetry::EngineTelemetry;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("analysis queue is full; trigger shed")]
    QueueFull,
    #[error("analysis pool is shut down")]
    Closed,
}

/// Bounded worker pool for anomaly analysis. Submission never waits: a full
/// queue sheds the trigger.
pub struct AnalysisPool {
    sender: mpsc::Sender<AnalysisTrigger>,
    workers: Vec<JoinHandle<()>>,
    telemetry: Arc<EngineTelemetry>,
}

impl AnalysisPool {
    /// Spawns the workers on the current runtime. Finished recommendations
    /// are delivered on the returned receiver.
    #[must_use]
    pub fn start(
        engine: &DecisionEngine,
        workers: usize,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Recommendation>) {
        let (sender, receiver) = mpsc::channel::<AnalysisTrigger>(queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel::<Recommendation>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let engine = engine.clone();
                let receiver = Arc::clone(&receiver);
                let results = results_tx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(trigger) = next else {
                            debug!(worker, "analysis worker stopping");
                            break;
                        };
                        let recommendation = engine.analyze(trigger).await;
                        if results.send(recommendation).await.is_err() {
                            warn!(worker, "recommendation receiver dropped");
                        }
                    }
                })
            })
            .collect();

        (
            Self {
                sender,
                workers,
                telemetry: Arc::clone(engine.telemetry_handle()),
            },
            results_rx,
        )
    }

    /// Starts a pool sized by the engine's ruleset.
    #[must_use]
    pub fn from_ruleset(engine: &DecisionEngine) -> (Self, mpsc::Receiver<Recommendation>) {
        let ruleset = engine.ruleset();
        Self::start(engine, ruleset.analysis_workers, ruleset.analysis_queue_capacity)
    }

    /// # Errors
    /// Returns [`DispatchError::QueueFull`] when the trigger was shed and
    /// [`DispatchError::Closed`] after shutdown.
    pub fn submit(&self, trigger: AnalysisTrigger) -> Result<(), DispatchError> {
        match self.sender.try_send(trigger) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                EngineTelemetry::bump(&self.telemetry.analyses_shed_total);
                warn!(
                    tenant_id = %trigger.tenant_id,
                    entity_id = %trigger.entity_id,
                    metric_name = %trigger.metric_name,
                    "analysis queue full; trigger shed"
                );
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Stops intake and waits for queued triggers to drain.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "analysis worker failed");
            }
        }
    }
}
