//! Probe execution: one request per configured protocol, an optional
//! single redirect hop, and the status/body filters.
use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{anyhow, Context, Result};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, LOCATION, USER_AGENT,
};
use reqwest::Url;
use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::client::{ClientCache, ProbeClient};
use crate::config::ScanConfig;
use crate::ratelimit::RateGate;
use crate::scratch::{ProbeScratch, Reset};
use crate::types::{MatchResult, Protocol, Target};

pub const USER_AGENT_VALUE: &str = "Mozilla/5.0 (X11; Linux x86_64)";
pub const ATTRIBUTION_HEADER: &str = "x-bug-bounty";
pub const ATTRIBUTION_VALUE: &str = "h1-damian89-test";

/// Verbose body dumps are cut to this many characters.
const VERBOSE_BODY_LIMIT: usize = 1000;

/// Issues the requests for a target and turns responses into matches.
#[derive(Debug, Clone)]
pub struct Prober {
    config: Arc<ScanConfig>,
    clients: Arc<ClientCache>,
    gate: Arc<RateGate>,
}

impl Prober {
    pub fn new(config: Arc<ScanConfig>, clients: Arc<ClientCache>, gate: Arc<RateGate>) -> Self {
        Self {
            config,
            clients,
            gate,
        }
    }

    /// Probe `target` over every configured protocol, in order.
    ///
    /// Each protocol is filtered on its own, so a target yields at most one
    /// match per protocol. Failed attempts are logged and skipped.
    pub async fn probe(&self, target: &Target, scratch: &mut ProbeScratch) -> Vec<MatchResult> {
        let mut matches = Vec::new();
        for &protocol in &self.config.protocols {
            scratch.reset();
            match self.attempt(target, protocol, scratch).await {
                Ok(Some(found)) => matches.push(found),
                Ok(None) => {}
                Err(e) => self.log_failure(target, protocol, &e),
            }
        }
        matches
    }

    async fn attempt(
        &self,
        target: &Target,
        protocol: Protocol,
        scratch: &mut ProbeScratch,
    ) -> Result<Option<MatchResult>> {
        let client = self.clients.acquire(&target.ip, protocol, &self.config)?;
        let url = Url::parse(&format!("{}{}", client.base_url(&target.ip), target.path))
            .with_context(|| format!("invalid request URI for {} {}", target.ip, target.path))?;
        let host = HeaderValue::from_str(&target.hostname)
            .with_context(|| format!("invalid Host header value: {}", target.hostname))?;
        fill_request_headers(&mut scratch.request_headers, host);

        self.gate.acquire().await;
        self.exchange(&client, url.clone(), scratch)
            .await
            .with_context(|| format!("failed to execute request to {url}"))?;

        let mut final_url = url;
        if self.config.follow_redirects && is_redirect(scratch.status) {
            if let Some(location) = header_str(&scratch.response_headers, &LOCATION) {
                let next = final_url
                    .join(&location)
                    .with_context(|| format!("invalid redirect location: {location}"))?;
                if self.config.verbose {
                    info!(from = %final_url, to = %next, "following redirect");
                }
                if !same_authority(&final_url, &next) {
                    scratch.request_headers.remove(HOST);
                }
                scratch.reset_response();
                self.gate.acquire().await;
                self.exchange(&client, next.clone(), scratch)
                    .await
                    .with_context(|| format!("failed to follow redirect to {next}"))?;
                final_url = next;
            }
        }

        let content_length = header_str(&scratch.response_headers, &CONTENT_LENGTH).unwrap_or_default();
        let body = String::from_utf8_lossy(&scratch.body);
        let title = extract_title(&body);

        if self.config.verbose {
            self.echo(target, &final_url, scratch, &content_length, &title, &body);
        }

        if !is_match(&self.config, scratch.status, &body) {
            return Ok(None);
        }

        Ok(Some(MatchResult {
            ip: target.ip.clone(),
            hostname: target.hostname.clone(),
            path: target.path.clone(),
            protocol,
            status: scratch.status,
            content_length,
            title: title.to_string(),
            timestamp: now_rfc3339(),
        }))
    }

    /// Send one GET and read status, headers and the full body into `scratch`.
    async fn exchange(&self, client: &ProbeClient, url: Url, scratch: &mut ProbeScratch) -> Result<()> {
        let request = client
            .http()
            .get(url)
            .headers(scratch.request_headers.clone())
            .timeout(self.config.request_timeout);

        let read = async {
            let mut response = request.send().await?;
            scratch.status = response.status().as_u16();
            scratch.response_headers.extend(
                response
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            while let Some(chunk) = response.chunk().await? {
                scratch.body.extend_from_slice(&chunk);
            }
            Ok::<_, reqwest::Error>(())
        };

        time::timeout(self.config.max_conn_duration, read)
            .await
            .map_err(|_| anyhow!("connection exceeded {:?}", self.config.max_conn_duration))??;
        Ok(())
    }

    fn log_failure(&self, target: &Target, protocol: Protocol, err: &anyhow::Error) {
        if self.config.verbose {
            warn!(
                ip = %target.ip,
                host = %target.hostname,
                path = %target.path,
                %protocol,
                error = %format!("{err:#}"),
                "probe attempt failed"
            );
        } else {
            debug!(
                ip = %target.ip,
                host = %target.hostname,
                %protocol,
                error = %format!("{err:#}"),
                "probe attempt failed"
            );
        }
    }

    fn echo(
        &self,
        target: &Target,
        url: &Url,
        scratch: &ProbeScratch,
        content_length: &str,
        title: &str,
        body: &str,
    ) {
        let mut out = String::new();
        let _ = writeln!(out, "=== Request ===");
        let _ = writeln!(out, "URI: {url}");
        let _ = writeln!(out, "Host: {}", target.hostname);
        let _ = writeln!(out, "Method: GET");
        write_headers(&mut out, &scratch.request_headers);
        let _ = writeln!(out, "=== Response ===");
        let _ = writeln!(out, "Status: {}", scratch.status);
        let _ = writeln!(out, "Content-Length: {content_length}");
        let _ = writeln!(out, "Title: {title}");
        write_headers(&mut out, &scratch.response_headers);
        if !body.is_empty() {
            let _ = writeln!(out, "Body (truncated):\n{}", truncate(body, VERBOSE_BODY_LIMIT));
        }
        info!(ip = %target.ip, host = %target.hostname, "\n{out}");
    }
}

fn fill_request_headers(headers: &mut HeaderMap, host: HeaderValue) {
    headers.insert(HOST, host);
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers.insert(
        HeaderName::from_static(ATTRIBUTION_HEADER),
        HeaderValue::from_static(ATTRIBUTION_VALUE),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
}

fn write_headers(out: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = writeln!(out, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn same_authority(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 307 | 308)
}

/// Status allow-list (empty accepts all) AND literal body substring (empty skips).
pub fn is_match(config: &ScanConfig, status: u16, body: &str) -> bool {
    let status_ok = config.http_status_is.is_empty() || config.http_status_is.contains(&status);
    let body_ok =
        config.http_body_includes.is_empty() || body.contains(config.http_body_includes.as_str());
    status_ok && body_ok
}

/// Text between the first `<title>` and the next `</title>`.
///
/// Case-sensitive and without entity decoding. No opening tag gives an empty
/// title; no closing tag gives the rest of the body.
pub fn extract_title(body: &str) -> &str {
    const OPEN: &str = "<title>";
    const CLOSE: &str = "</title>";
    let Some(start) = body.find(OPEN) else {
        return "";
    };
    let rest = &body[start + OPEN.len()..];
    match rest.find(CLOSE) {
        Some(end) => &rest[..end],
        None => rest,
    }
}

fn truncate(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(format!("{}...", &s[..idx])),
        None => Cow::Borrowed(s),
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
