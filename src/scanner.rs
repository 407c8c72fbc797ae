use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::mpsc;
use tracing::info;

use crate::client::ClientCache;
use crate::config::ScanConfig;
use crate::probe::Prober;
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::ratelimit::RateGate;
use crate::targets::TargetGenerator;
use crate::types::{MatchResult, ScanSummary};
use crate::workers::WorkerPool;

/// Run controller wiring generator, workers and result sink together.
///
/// State that lives for a scan (client cache, rate gate) is owned here and
/// handed to workers explicitly, so several scanners can run in one process.
///
/// - The target and result queues are bounded by `queue_capacity`, so a
///   fast producer or slow sink applies backpressure instead of buffering.
/// - A fatal generator error still lets workers drain and the sink finish
///   before the error is returned.
#[derive(Debug)]
pub struct Scanner {
    config: Arc<ScanConfig>,
    clients: Arc<ClientCache>,
    gate: Arc<RateGate>,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Result<Self> {
        config.validate().context("invalid scan configuration")?;
        let gate = Arc::new(RateGate::new(config.rate_limit));
        Ok(Self {
            config: Arc::new(config),
            clients: Arc::new(ClientCache::new()),
            gate,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// Scan the cross product of two line files. See [`Scanner::run`].
    pub async fn run_files<F>(
        &self,
        ip_path: impl AsRef<Path>,
        host_path: impl AsRef<Path>,
        reporter: Arc<dyn ProgressReporter>,
        on_match: F,
    ) -> Result<ScanSummary>
    where
        F: FnMut(MatchResult) + Send + 'static,
    {
        let generator = TargetGenerator::open(ip_path, host_path, self.config.paths.clone()).await?;
        self.run(generator, reporter, on_match).await
    }

    /// Drive a full scan and call `on_match` for each match as it arrives.
    ///
    /// Returns once every target has been probed and every match delivered.
    pub async fn run<I, H, F>(
        &self,
        generator: TargetGenerator<I, H>,
        reporter: Arc<dyn ProgressReporter>,
        on_match: F,
    ) -> Result<ScanSummary>
    where
        I: AsyncRead + Unpin + Send + 'static,
        H: AsyncRead + AsyncSeek + Unpin + Send + 'static,
        F: FnMut(MatchResult) + Send + 'static,
    {
        let started = Instant::now();
        let capacity = self.config.queue_capacity();
        let (target_tx, target_rx) = mpsc::channel(capacity);
        let (result_tx, mut result_rx) = mpsc::channel(capacity);
        let progress = Arc::new(ProgressTracker::new(
            reporter,
            self.config.progress_batch,
            self.config.progress_interval,
        ));

        info!(
            workers = self.config.concurrency,
            capacity,
            protocols = ?self.config.protocols,
            paths = self.config.paths.len(),
            rate_limit = self.config.rate_limit,
            "starting scan"
        );

        let generator = generator.with_chunk_sizes(self.config.ip_chunk_size, self.config.host_chunk_size);
        let producer = tokio::spawn(generator.generate(target_tx));

        let prober = Prober::new(self.config.clone(), self.clients.clone(), self.gate.clone());
        let pool = WorkerPool::start(
            self.config.concurrency,
            target_rx,
            prober,
            result_tx,
            progress.clone(),
        );

        let sink = tokio::spawn(async move {
            let mut on_match = on_match;
            let mut delivered = 0u64;
            while let Some(found) = result_rx.recv().await {
                on_match(found);
                delivered += 1;
            }
            delivered
        });

        let processed = pool.wait().await;
        let matches = sink.await.context("result sink task failed")?;
        let generated = producer.await.context("target generator task failed")?;
        progress.finish();
        let targets_generated = generated.context("target generation aborted")?;

        let summary = ScanSummary {
            targets_generated,
            targets_processed: processed,
            matches,
            elapsed: started.elapsed(),
        };
        info!(
            generated = summary.targets_generated,
            processed = summary.targets_processed,
            matches = summary.matches,
            clients = self.clients.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scan finished"
        );
        Ok(summary)
    }
}
