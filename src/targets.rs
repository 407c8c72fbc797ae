//! Streaming generation of the `ip x hostname x path` cross product.
//!
//! Both line sources are read in bounded chunks. For every chunk of IPs the
//! hostname source is rewound and read again chunk by chunk, so memory stays
//! at `O(ip_chunk + host_chunk)` no matter how large the inputs are.
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::debug;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::types::Target;

/// Longest accepted input line. Anything longer aborts the read.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

fn line_frames<R: AsyncRead>(source: R) -> FramedRead<R, AnyDelimiterCodec> {
    FramedRead::new(
        source,
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_LENGTH),
    )
}

/// Trimmed text of a raw line, or `None` when it is blank.
///
/// Lines are opaque bytes: invalid UTF-8 is replaced rather than rejected,
/// so one bad byte never stops the rest of the file from being read.
fn usable_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Chunked reader yielding trimmed, non-blank lines.
struct LineChunks<R> {
    lines: FramedRead<R, AnyDelimiterCodec>,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> LineChunks<R> {
    fn new(source: R) -> Self {
        Self {
            lines: line_frames(source),
            exhausted: false,
        }
    }

    /// Up to `size` usable lines. An empty chunk means the source is done.
    async fn next_chunk(&mut self, size: usize) -> Result<Vec<String>> {
        let mut chunk = Vec::with_capacity(size.min(1024));
        while !self.exhausted && chunk.len() < size {
            match self.lines.next().await {
                Some(raw) => {
                    if let Some(line) = usable_line(&raw?) {
                        chunk.push(line);
                    }
                }
                None => self.exhausted = true,
            }
        }
        Ok(chunk)
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> LineChunks<R> {
    /// Seek the underlying source back to its start and drop any buffered data.
    async fn rewind(self) -> Result<Self> {
        let mut source = self.lines.into_inner();
        source.seek(SeekFrom::Start(0)).await?;
        Ok(Self::new(source))
    }
}

/// Producer half of the pipeline.
pub struct TargetGenerator<I, H> {
    ips: I,
    hosts: H,
    paths: Arc<[String]>,
    ip_chunk_size: usize,
    host_chunk_size: usize,
}

impl TargetGenerator<File, File> {
    /// Open both input files. Failure to open either is fatal for the run.
    pub async fn open(
        ip_path: impl AsRef<Path>,
        host_path: impl AsRef<Path>,
        paths: impl Into<Arc<[String]>>,
    ) -> Result<Self> {
        let ips = File::open(ip_path.as_ref())
            .await
            .with_context(|| format!("failed to open IP file: {}", ip_path.as_ref().display()))?;
        let hosts = File::open(host_path.as_ref()).await.with_context(|| {
            format!("failed to open hostname file: {}", host_path.as_ref().display())
        })?;
        Ok(Self::new(ips, hosts, paths))
    }
}

impl<I, H> TargetGenerator<I, H>
where
    I: AsyncRead + Unpin,
    H: AsyncRead + AsyncSeek + Unpin,
{
    pub fn new(ips: I, hosts: H, paths: impl Into<Arc<[String]>>) -> Self {
        Self {
            ips,
            hosts,
            paths: paths.into(),
            ip_chunk_size: DEFAULT_CHUNK_SIZE,
            host_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_sizes(mut self, ip_chunk_size: usize, host_chunk_size: usize) -> Self {
        self.ip_chunk_size = ip_chunk_size.max(1);
        self.host_chunk_size = host_chunk_size.max(1);
        self
    }

    /// Push every target into `tx` and return how many were sent.
    ///
    /// `tx` is consumed, so the queue closes when this returns, on success
    /// and on error alike. Read and rewind failures are returned as errors.
    pub async fn generate(self, tx: mpsc::Sender<Target>) -> Result<u64> {
        let Self {
            ips,
            hosts,
            paths,
            ip_chunk_size,
            host_chunk_size,
        } = self;

        let mut ip_lines = LineChunks::new(ips);
        let mut host_lines = LineChunks::new(hosts);
        let mut emitted = 0u64;

        loop {
            let ip_chunk = ip_lines
                .next_chunk(ip_chunk_size)
                .await
                .context("failed to read IP source")?;
            if ip_chunk.is_empty() {
                break;
            }

            host_lines = host_lines
                .rewind()
                .await
                .context("failed to rewind hostname source")?;

            loop {
                let host_chunk = host_lines
                    .next_chunk(host_chunk_size)
                    .await
                    .context("failed to read hostname source")?;
                if host_chunk.is_empty() {
                    break;
                }

                for ip in &ip_chunk {
                    for host in &host_chunk {
                        for path in paths.iter() {
                            tx.send(Target::new(ip.as_str(), host.as_str(), path.as_str()))
                                .await
                                .map_err(|_| anyhow!("target queue closed before generation finished"))?;
                            emitted += 1;
                        }
                    }
                }
            }
        }

        debug!(emitted, "target generation finished");
        Ok(emitted)
    }
}

/// Count trimmed, non-blank lines using the same rules as the generator.
pub async fn count_lines<R: AsyncRead + Unpin>(source: R) -> Result<u64> {
    let mut lines = line_frames(source);
    let mut count = 0u64;
    while let Some(raw) = lines.next().await {
        if usable_line(&raw?).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// `|ips| * |hosts| * paths_count`, computed without building the product.
pub async fn count_total_targets(
    ip_path: impl AsRef<Path>,
    host_path: impl AsRef<Path>,
    paths_count: usize,
) -> Result<u64> {
    let ip_path = ip_path.as_ref();
    let host_path = host_path.as_ref();
    let ips = count_lines(
        File::open(ip_path)
            .await
            .with_context(|| format!("failed to open IP file: {}", ip_path.display()))?,
    )
    .await
    .context("error counting IPs")?;
    let hosts = count_lines(
        File::open(host_path)
            .await
            .with_context(|| format!("failed to open hostname file: {}", host_path.display()))?,
    )
    .await
    .context("error counting hosts")?;
    Ok(ips.saturating_mul(hosts).saturating_mul(paths_count as u64))
}
