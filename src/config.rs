use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;

use crate::types::Protocol;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_PROGRESS_BATCH: u64 = 10_000;

/// Immutable settings shared by every stage of a scan.
///
/// Build one, call [`ScanConfig::validate`], then hand it to
/// [`Scanner::new`](crate::scanner::Scanner::new), which wraps it in an `Arc`
/// so workers read it without copying.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Schemes probed for every target, in order.
    pub protocols: Vec<Protocol>,
    /// Paths appended to every `(ip, host)` pair. Each starts with `/`.
    pub paths: Vec<String>,
    /// Accepted status codes. Empty accepts any status.
    pub http_status_is: Vec<u16>,
    /// Literal substring the body must contain. Empty disables the check.
    pub http_body_includes: String,
    pub request_timeout: Duration,
    pub max_idle_conn_duration: Duration,
    pub max_conn_duration: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Number of probe workers.
    pub concurrency: usize,
    /// Requests per second across all workers, 0 for unlimited.
    pub rate_limit: u32,
    pub follow_redirects: bool,
    pub verbose: bool,
    /// Capacity of the target and result queues. `None` means `2 * concurrency`.
    pub queue_capacity: Option<usize>,
    pub ip_chunk_size: usize,
    pub host_chunk_size: usize,
    /// Progress display refreshes every this many processed targets...
    pub progress_batch: u64,
    /// ...or after this much time since the last refresh.
    pub progress_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            protocols: vec![Protocol::Http],
            paths: vec!["/".to_string()],
            http_status_is: Vec::new(),
            http_body_includes: String::new(),
            request_timeout: Duration::from_secs(4),
            max_idle_conn_duration: Duration::from_secs(6),
            max_conn_duration: Duration::from_secs(6),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            concurrency: 100,
            rate_limit: 0,
            follow_redirects: false,
            verbose: false,
            queue_capacity: None,
            ip_chunk_size: DEFAULT_CHUNK_SIZE,
            host_chunk_size: DEFAULT_CHUNK_SIZE,
            progress_batch: DEFAULT_PROGRESS_BATCH,
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl ScanConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.protocols.is_empty() {
            bail!("at least one protocol (http or https) is required");
        }
        if self.paths.is_empty() {
            bail!("at least one path is required");
        }
        if let Some(bad) = self.paths.iter().find(|p| !p.starts_with('/')) {
            bail!("path must start with '/': {bad}");
        }
        if let Some(bad) = self.paths.iter().find(|p| !sent_verbatim(p)) {
            bail!("path would not be sent as written (fragment or dot segment): {bad}");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.ip_chunk_size == 0 || self.host_chunk_size == 0 {
            bail!("chunk sizes must be at least 1");
        }
        if self.queue_capacity == Some(0) {
            bail!("queue capacity must be at least 1");
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.concurrency.saturating_mul(2))
            .max(1)
    }
}

/// Request URLs are normalised before sending, which drops a `#fragment`
/// and collapses `.`/`..` segments. Such paths are refused up front.
fn sent_verbatim(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or_default();
    !path.contains('#') && !path.split('/').any(|seg| seg == "." || seg == "..")
}

/// Parse a comma separated list of HTTP status codes (`"200, 301,302"`).
///
/// Blank entries are skipped; anything outside 100..=599 is an error.
pub fn parse_status_codes(s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    for raw in s.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let code: u16 = entry
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid HTTP status code: {entry}"))?;
        if !(100..=599).contains(&code) {
            bail!("HTTP status code out of range: {code}");
        }
        if !out.contains(&code) {
            out.push(code);
        }
    }
    Ok(out)
}

/// Split a comma separated path list, prefixing `/` where it is missing.
/// An input with no usable entries yields `["/"]`.
pub fn parse_paths(s: &str) -> Vec<String> {
    let mut out: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p.starts_with('/') {
                p.to_string()
            } else {
                format!("/{p}")
            }
        })
        .collect();
    if out.is_empty() {
        out.push("/".to_string());
    }
    out
}

/// Parse a comma separated protocol list. Unknown names are dropped; when
/// nothing valid remains the list falls back to plain `http`.
pub fn parse_protocols(s: &str) -> Vec<Protocol> {
    let mut out = Vec::new();
    for p in s.split(',').filter_map(Protocol::from_name) {
        if !out.contains(&p) {
            out.push(p);
        }
    }
    if out.is_empty() {
        tracing::warn!(input = s, "no valid protocols given, falling back to http");
        out.push(Protocol::Http);
    }
    out
}
