use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use vhost_scan_rs::config::{parse_paths, parse_protocols, parse_status_codes, ScanConfig};
use vhost_scan_rs::scanner::Scanner;
use vhost_scan_rs::targets::count_total_targets;
use vhost_scan_rs::types::MatchResult;

/// vhost-scan-rs: probe every IP x Host header x path combination and report responses that match.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "vhost-scan-rs",
    version,
    about = "Probe every IP x Host header x path combination over HTTP/HTTPS and report matching responses.",
    long_about = None
)]
struct Cli {
    /// File containing IP addresses, one per line (optionally ip:port).
    #[arg(long)]
    ips: PathBuf,

    /// File containing hostnames to send in the Host header, one per line.
    #[arg(long)]
    hosts: PathBuf,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Comma-separated list of paths to check.
    #[arg(long, default_value = "/")]
    paths: String,

    /// Comma-separated list of protocols (http,https).
    #[arg(long, default_value = "http")]
    protocol: String,

    /// String the response body must contain.
    #[arg(long = "http-body-includes", default_value = "")]
    http_body_includes: String,

    /// Comma-separated list of accepted HTTP status codes.
    #[arg(long = "http-status-is", default_value = "")]
    http_status_is: String,

    /// Timeout for individual requests in seconds.
    #[arg(long = "request-timeout", default_value_t = 4)]
    request_timeout: u64,

    /// Maximum idle connection duration in seconds.
    #[arg(long = "max-idle-timeout", default_value_t = 6)]
    max_idle_timeout: u64,

    /// Maximum connection duration in seconds.
    #[arg(long = "max-conn-timeout", default_value_t = 6)]
    max_conn_timeout: u64,

    /// Read timeout in seconds.
    #[arg(long = "read-timeout", default_value_t = 5)]
    read_timeout: u64,

    /// Write (connect) timeout in seconds.
    #[arg(long = "write-timeout", default_value_t = 5)]
    write_timeout: u64,

    /// Show every request and response.
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Requests per second across all workers (0 for no limit).
    #[arg(long = "rate-limit", default_value_t = 0)]
    rate_limit: u32,

    /// Follow a single HTTP redirect (301/302/307/308).
    #[arg(long = "redirect", default_value_t = false)]
    redirect: bool,

    /// Also append every match as a JSON line to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn scan_config(&self) -> Result<ScanConfig> {
        Ok(ScanConfig {
            protocols: parse_protocols(&self.protocol),
            paths: parse_paths(&self.paths),
            http_status_is: parse_status_codes(&self.http_status_is)?,
            http_body_includes: self.http_body_includes.clone(),
            request_timeout: Duration::from_secs(self.request_timeout),
            max_idle_conn_duration: Duration::from_secs(self.max_idle_timeout),
            max_conn_duration: Duration::from_secs(self.max_conn_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
            concurrency: self.concurrency,
            rate_limit: self.rate_limit,
            follow_redirects: self.redirect,
            verbose: self.verbose,
            ..ScanConfig::default()
        })
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "vhost_scan_rs=debug"
    } else {
        "vhost_scan_rs=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.scan_config()?;
    let scanner = Scanner::new(config)?;

    println!("[*] Counting targets...");
    let count_started = Instant::now();
    let total = count_total_targets(&cli.ips, &cli.hosts, scanner.config().paths.len())
        .await
        .context("error counting targets")?;
    println!(
        "[+] Found {} total targets (took {:?})",
        total,
        count_started.elapsed()
    );

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Scanning targets... [{bar:30.green}] {pos}/{len} ({eta})")
            .context("invalid progress template")?
            .progress_chars("=> "),
    );

    let output = match cli.output.as_deref() {
        Some(path) => Some(Arc::new(Mutex::new(open_output(path)?))),
        None => None,
    };
    let writer = output.clone();

    println!("[*] Starting scan with {} workers...", scanner.config().concurrency);
    let printer = bar.clone();
    let summary = scanner
        .run_files(&cli.ips, &cli.hosts, Arc::new(bar.clone()), move |found| {
            printer.suspend(|| println!("{found}"));
            if let Some(out) = writer.as_deref() {
                let mut out = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Err(e) = write_match_json(&mut out, &found) {
                    tracing::warn!(error = %e, "failed to write match to output file");
                }
            }
        })
        .await?;

    println!("[+] Scan completed!");
    println!(
        "[+] Completed in {:?}: {} targets processed, {} matches",
        summary.elapsed, summary.targets_processed, summary.matches
    );
    if let (Some(path), Some(out)) = (cli.output.as_deref(), output) {
        out.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
            .with_context(|| format!("failed to flush output file: {}", path.display()))?;
        println!("[+] Appended JSON lines to {}", path.display());
    }
    Ok(())
}

/// Matches are appended; earlier contents of the file are kept.
fn open_output(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open output file: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Buffered; the writer is flushed once after the scan.
fn write_match_json(out: &mut BufWriter<File>, found: &MatchResult) -> Result<()> {
    serde_json::to_writer(&mut *out, found)?;
    out.write_all(b"\n")?;
    Ok(())
}
