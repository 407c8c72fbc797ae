use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    Router,
};
use tempfile::NamedTempFile;
use vhost_scan_rs::config::ScanConfig;
use vhost_scan_rs::progress::{NoProgress, ProgressReporter};
use vhost_scan_rs::scanner::Scanner;
use vhost_scan_rs::targets::count_total_targets;
use vhost_scan_rs::types::{MatchResult, Protocol};

/// Echoes the received Host header as the page title.
async fn vhost_page(headers: HeaderMap, uri: Uri) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let tagged = headers.contains_key("x-bug-bounty");
    match uri.path() {
        "/old" => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/new")], "moved").into_response(),
        "/a" => (StatusCode::FOUND, [(header::LOCATION, "/b")], "moved").into_response(),
        "/b" => (StatusCode::FOUND, [(header::LOCATION, "/c")], "moved").into_response(),
        "/bare" => (StatusCode::MOVED_PERMANENTLY, "moved").into_response(),
        "/missing" => (StatusCode::NOT_FOUND, Html("<title>Not Found</title>".to_string())).into_response(),
        path => Html(format!(
            "<html><title>{host}</title><body>path={path} tagged={tagged}</body></html>"
        ))
        .into_response(),
    }
}

async fn spawn_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(vhost_page);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn lines_file(lines: &[String]) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(f, "{line}").unwrap();
    }
    f.flush().unwrap();
    f
}

struct Fixture {
    ips: NamedTempFile,
    hosts: NamedTempFile,
    ip_lines: Vec<String>,
    host_lines: Vec<String>,
}

async fn two_servers_three_hosts() -> Fixture {
    let a = spawn_server().await;
    let b = spawn_server().await;
    let ip_lines = vec![a.to_string(), b.to_string()];
    let host_lines: Vec<String> = ["alpha.example", "beta.example", "gamma.example"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    Fixture {
        ips: lines_file(&ip_lines),
        hosts: lines_file(&host_lines),
        ip_lines,
        host_lines,
    }
}

fn config(paths: &[&str]) -> ScanConfig {
    ScanConfig {
        paths: paths.iter().map(|p| p.to_string()).collect(),
        concurrency: 4,
        request_timeout: Duration::from_secs(2),
        ..ScanConfig::default()
    }
}

async fn scan(fixture: &Fixture, config: ScanConfig) -> (Vec<MatchResult>, u64, u64) {
    let scanner = Scanner::new(config).unwrap();
    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = found.clone();
    let summary = scanner
        .run_files(
            fixture.ips.path(),
            fixture.hosts.path(),
            Arc::new(NoProgress),
            move |m| sink.lock().unwrap().push(m),
        )
        .await
        .unwrap();
    let found = found.lock().unwrap().clone();
    assert_eq!(summary.matches, found.len() as u64);
    (found, summary.targets_generated, summary.targets_processed)
}

#[tokio::test]
async fn every_combination_is_probed_with_its_host_header() {
    let fixture = two_servers_three_hosts().await;
    let (found, generated, processed) = scan(&fixture, config(&["/", "/admin"])).await;

    assert_eq!(generated, 12);
    assert_eq!(processed, 12);
    assert_eq!(found.len(), 12);

    let mut expected = HashSet::new();
    for ip in &fixture.ip_lines {
        for host in &fixture.host_lines {
            for path in ["/", "/admin"] {
                expected.insert((ip.clone(), host.clone(), path.to_string()));
            }
        }
    }
    let seen: HashSet<_> = found
        .iter()
        .map(|m| (m.ip.clone(), m.hostname.clone(), m.path.clone()))
        .collect();
    assert_eq!(seen, expected);

    for m in &found {
        assert_eq!(m.status, 200);
        assert_eq!(m.protocol, Protocol::Http);
        assert_eq!(m.title, m.hostname);
        assert!(!m.content_length.is_empty());
        assert!(!m.timestamp.is_empty());
    }
}

#[tokio::test]
async fn total_count_matches_generated_targets() {
    let fixture = two_servers_three_hosts().await;
    let total = count_total_targets(fixture.ips.path(), fixture.hosts.path(), 2)
        .await
        .unwrap();
    let (_, generated, _) = scan(&fixture, config(&["/", "/admin"])).await;
    assert_eq!(total, 12);
    assert_eq!(generated, total);
}

#[tokio::test]
async fn status_allow_list_filters_responses() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        http_status_is: vec![404],
        ..config(&["/", "/missing"])
    };
    let (found, _, processed) = scan(&fixture, cfg).await;
    assert_eq!(processed, 12);
    assert_eq!(found.len(), 6);
    assert!(found.iter().all(|m| m.status == 404 && m.path == "/missing"));
    assert!(found.iter().all(|m| m.title == "Not Found"));
}

#[tokio::test]
async fn body_substring_filters_responses() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        http_body_includes: "path=/admin".into(),
        ..config(&["/", "/admin"])
    };
    let (found, _, _) = scan(&fixture, cfg).await;
    assert_eq!(found.len(), 6);
    assert!(found.iter().all(|m| m.path == "/admin"));
}

#[tokio::test]
async fn attribution_header_is_sent() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        http_body_includes: "tagged=true".into(),
        ..config(&["/"])
    };
    let (found, _, _) = scan(&fixture, cfg).await;
    assert_eq!(found.len(), 6);
}

#[tokio::test]
async fn redirect_is_reported_as_is_by_default() {
    let fixture = two_servers_three_hosts().await;
    let (found, _, _) = scan(&fixture, config(&["/old"])).await;
    assert_eq!(found.len(), 6);
    assert!(found.iter().all(|m| m.status == 301 && m.title.is_empty()));
}

#[tokio::test]
async fn redirect_followed_once_when_enabled() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        follow_redirects: true,
        ..config(&["/old"])
    };
    let (found, _, _) = scan(&fixture, cfg).await;
    assert_eq!(found.len(), 6);
    for m in &found {
        assert_eq!(m.status, 200);
        // Same authority, so the Host header survives the hop.
        assert_eq!(m.title, m.hostname);
        assert_eq!(m.path, "/old");
    }
}

#[tokio::test]
async fn redirect_chain_stops_after_one_hop() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        follow_redirects: true,
        ..config(&["/a"])
    };
    let (found, _, _) = scan(&fixture, cfg).await;
    assert_eq!(found.len(), 6);
    for m in &found {
        // /a -> /b is followed, /b -> /c is not.
        assert_eq!(m.status, 302);
        assert!(m.title.is_empty());
        assert_eq!(m.path, "/a");
    }
}

#[tokio::test]
async fn redirect_without_location_is_reported_as_is() {
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        follow_redirects: true,
        ..config(&["/bare"])
    };
    let (found, _, processed) = scan(&fixture, cfg).await;
    assert_eq!(processed, 6);
    assert_eq!(found.len(), 6);
    assert!(found.iter().all(|m| m.status == 301 && m.title.is_empty()));
}

#[tokio::test]
async fn failed_protocol_does_not_hide_the_other() {
    // Plain HTTP servers: every https attempt fails its TLS handshake.
    let fixture = two_servers_three_hosts().await;
    let cfg = ScanConfig {
        protocols: vec![Protocol::Https, Protocol::Http],
        ..config(&["/", "/admin"])
    };
    let (found, generated, processed) = scan(&fixture, cfg).await;
    assert_eq!(generated, 12);
    assert_eq!(processed, 12);
    assert_eq!(found.len(), 12);
    assert!(found.iter().all(|m| m.protocol == Protocol::Http));
}

#[tokio::test]
async fn rate_limit_paces_probes() {
    let addr = spawn_server().await;
    let rate = 5u32;
    let ips = lines_file(&[addr.to_string()]);
    let host_lines: Vec<String> = (0..5 * rate).map(|i| format!("h{i}.example")).collect();
    let hosts = lines_file(&host_lines);

    let scanner = Scanner::new(ScanConfig {
        rate_limit: rate,
        ..config(&["/"])
    })
    .unwrap();
    let started = Instant::now();
    let summary = scanner
        .run_files(ips.path(), hosts.path(), Arc::new(NoProgress), |_| {})
        .await
        .unwrap();
    assert_eq!(summary.targets_processed, u64::from(5 * rate));
    assert!(started.elapsed() >= Duration::from_secs(4), "took {:?}", started.elapsed());
}

#[derive(Default)]
struct FinalCount(Mutex<Option<u64>>);

impl ProgressReporter for FinalCount {
    fn update(&self, _processed: u64) {}

    fn finish(&self, processed: u64) {
        *self.0.lock().unwrap() = Some(processed);
    }
}

#[tokio::test]
async fn progress_reports_every_processed_target() {
    let fixture = two_servers_three_hosts().await;
    let scanner = Scanner::new(ScanConfig {
        http_status_is: vec![418],
        ..config(&["/", "/admin", "/x"])
    })
    .unwrap();
    let reporter = Arc::new(FinalCount::default());
    let summary = scanner
        .run_files(fixture.ips.path(), fixture.hosts.path(), reporter.clone(), |_| {})
        .await
        .unwrap();
    assert_eq!(summary.matches, 0);
    assert_eq!(*reporter.0.lock().unwrap(), Some(18));
}

#[tokio::test]
async fn missing_input_file_is_fatal() {
    let hosts = lines_file(&["a.example".to_string()]);
    let scanner = Scanner::new(config(&["/"])).unwrap();
    let err = scanner
        .run_files(
            "/nonexistent/vhost-scan-ips.txt",
            hosts.path(),
            Arc::new(NoProgress),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to open IP file"));
}
