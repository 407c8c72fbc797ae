use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::ScanConfig;
use crate::types::Protocol;

/// Reusable HTTP client bound to one `(ip, protocol)` pair.
#[derive(Debug)]
pub struct ProbeClient {
    pub protocol: Protocol,
    http: reqwest::Client,
}

impl ProbeClient {
    fn build(protocol: Protocol, config: &ScanConfig) -> Result<Self> {
        // Targets are raw IPs, so certificates never match the address.
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("failed to build TLS connector")?;

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .http1_only()
            .connect_timeout(config.write_timeout)
            .read_timeout(config.read_timeout)
            .pool_idle_timeout(config.max_idle_conn_duration)
            .build()
            .with_context(|| format!("failed to build {protocol} client"))?;

        Ok(Self { protocol, http })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `scheme://authority` for an input line.
    ///
    /// A bare address gets the protocol's default port, an IPv6 literal is
    /// bracketed, and a line that already names a port is used as given.
    pub fn base_url(&self, ip: &str) -> String {
        let port = self.protocol.default_port();
        let authority = if ip.parse::<SocketAddr>().is_ok() {
            ip.to_string()
        } else if ip.parse::<Ipv6Addr>().is_ok() {
            format!("[{ip}]:{port}")
        } else if ip.contains(':') {
            ip.to_string()
        } else {
            format!("{ip}:{port}")
        };
        format!("{}://{}", self.protocol.scheme(), authority)
    }
}

/// One client per `(ip, protocol)`, created on first use and kept for the
/// rest of the scan.
///
/// The protocol is part of the key so an `http` attempt never reuses a
/// client configured for `https` against the same address, or vice versa.
#[derive(Debug, Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<(String, Protocol), Arc<ProbeClient>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for the key, building it under the lock if absent.
    pub fn acquire(&self, ip: &str, protocol: Protocol, config: &ScanConfig) -> Result<Arc<ProbeClient>> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&(ip.to_string(), protocol)) {
            return Ok(client.clone());
        }
        let client = Arc::new(ProbeClient::build(protocol, config)?);
        debug!(ip, %protocol, "created client");
        clients.insert((ip.to_string(), protocol), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
