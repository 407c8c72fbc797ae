use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::probe::Prober;
use crate::progress::ProgressTracker;
use crate::scratch::{ProbeScratch, ScratchPool};
use crate::types::{MatchResult, Target};

/// Fixed set of probe workers draining one shared target queue.
#[derive(Debug)]
pub struct WorkerPool {
    set: JoinSet<u64>,
    scratch: Arc<ScratchPool<ProbeScratch>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks. Each runs until the target queue is closed and
    /// empty, sending matches to `results` and counting every target once.
    pub fn start(
        workers: usize,
        targets: mpsc::Receiver<Target>,
        prober: Prober,
        results: mpsc::Sender<MatchResult>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        let targets = Arc::new(Mutex::new(targets));
        let scratch = ScratchPool::<ProbeScratch>::new();
        let mut set = JoinSet::new();

        for id in 0..workers.max(1) {
            let targets = targets.clone();
            let prober = prober.clone();
            let results = results.clone();
            let progress = progress.clone();
            let scratch = scratch.clone();

            set.spawn(async move {
                // Held for the worker's lifetime, never shared with another worker.
                let mut buf = scratch.acquire();
                let mut handled = 0u64;
                loop {
                    let next = { targets.lock().await.recv().await };
                    let Some(target) = next else { break };

                    for found in prober.probe(&target, &mut buf).await {
                        if results.send(found).await.is_err() {
                            warn!(worker = id, "result queue closed, dropping match");
                        }
                    }
                    progress.increment();
                    handled += 1;
                }
                debug!(worker = id, handled, "worker finished");
                handled
            });
        }

        Self { set, scratch }
    }

    /// Wait for every worker to see the closed queue and exit.
    /// Returns the number of targets handled across all workers.
    pub async fn wait(mut self) -> u64 {
        let mut total = 0;
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(handled) => total += handled,
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        debug!(idle_buffers = self.scratch.idle(), "worker pool drained");
        total
    }
}
