//! HTTP probe implementation.
//!
//! Every path of every configured target is requested from the monitor's IP,
//! with the target's hostname supplied for SNI and the Host header. Results
//! from all targets are folded into one report sent to the first target's
//! column.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HOST;
use reqwest::{StatusCode, Url};
use tracing::Instrument;

use super::{format_micros, ProbeContext, ProbeError};
use crate::monitor::{HttpTargetConfig, MonitorDefinition};
use crate::report::StatusReport;
use crate::status::{Status, Tally};

/// A prepared GET request for one target path.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// `scheme://<ip><path>`; the target's port is not part of it.
    pub url: Url,
    /// Value for the Host header and TLS server name, if configured.
    pub hostname: Option<String>,
    pub basic_auth: Option<(String, Option<String>)>,
}

impl PreparedRequest {
    pub fn uses_tls(&self) -> bool {
        self.url.scheme() == "https"
    }
}

/// Build the request for `path` on `target`, addressed to `ip`.
pub fn build_request(ip: &str, target: &HttpTargetConfig, path: &str) -> Result<PreparedRequest, ProbeError> {
    let scheme = if target.use_tls { "https" } else { "http" };
    let host = match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => ip.to_string(),
    };

    let raw = format!("{}://{}{}", scheme, host, path);
    let url = Url::parse(&raw).map_err(|e| ProbeError::Request(format!("{}: {}", raw, e)))?;

    let hostname = Some(target.hostname.clone()).filter(|h| !h.is_empty());
    let basic_auth = target
        .credentials()
        .map(|(user, password)| (user.to_string(), password.map(str::to_string)));

    Ok(PreparedRequest {
        url,
        hostname,
        basic_auth,
    })
}

/// Whether a response code counts as reachable. 401 is tolerated: the
/// service answered, it just wants credentials.
pub fn is_good_status(code: u16) -> bool {
    code <= 399 || code == StatusCode::UNAUTHORIZED.as_u16()
}

/// Latency extremes and totals across all good responses of one monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HttpStats {
    pub tally: Tally,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub sum: Duration,
}

impl HttpStats {
    pub fn record_good(&mut self, elapsed: Duration) {
        self.tally.good += 1;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
        self.sum += elapsed;
    }

    pub fn record_bad(&mut self) {
        self.tally.bad += 1;
    }

    /// Mean latency of good responses; `None` when there were none.
    pub fn avg(&self) -> Option<Duration> {
        match self.tally.good {
            0 => None,
            n => Some(self.sum / u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    /// Red on any failure. Mixed results are only told apart at monitor level.
    pub fn status(&self) -> Status {
        if self.tally.bad > 0 {
            Status::Red
        } else {
            Status::Green
        }
    }

    pub fn summary(&self) -> String {
        let render = |d: Option<Duration>| d.map_or_else(|| "n/a".to_string(), format_micros);
        format!(
            "Min: {}\nAvg: {}\nMax: {}\nSuccess: {}\nFailures: {}\n",
            render(self.min),
            render(self.avg()),
            render(self.max),
            self.tally.good,
            self.tally.bad
        )
    }
}

/// Status code and round-trip time of one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    /// Time spent sending the request and receiving the response head.
    pub elapsed: Duration,
}

/// Issues prepared HTTP requests.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Send the request. `elapsed` covers the exchange only, never client setup.
    async fn fetch(&self, request: &PreparedRequest) -> Result<FetchResponse, ProbeError>;
}

/// Final URL of a request and the address its hostname is pinned to.
#[derive(Debug, Clone, PartialEq)]
struct Route {
    url: Url,
    pin: Option<(String, SocketAddr)>,
}

/// For TLS with a hostname the URL carries the hostname, so it becomes the
/// server name, while the connection is pinned to the IP. Everything else is
/// sent as built.
fn route(request: &PreparedRequest) -> Result<Route, ProbeError> {
    let pinned_ip = request
        .url
        .host_str()
        .map(|h| h.trim_matches(|c| c == '[' || c == ']'))
        .and_then(|h| h.parse::<IpAddr>().ok());

    let (Some(hostname), Some(ip), true) = (request.hostname.as_deref(), pinned_ip, request.uses_tls())
    else {
        return Ok(Route {
            url: request.url.clone(),
            pin: None,
        });
    };

    let port = request.url.port_or_known_default().unwrap_or(443);
    let mut url = request.url.clone();
    url.set_host(Some(hostname))
        .map_err(|e| ProbeError::Request(format!("bad hostname {}: {}", hostname, e)))?;

    Ok(Route {
        url,
        pin: Some((hostname.to_string(), SocketAddr::new(ip, port))),
    })
}

/// reqwest-backed fetcher.
#[derive(Debug)]
pub struct ReqwestFetcher {
    timeout: Duration,
    client: reqwest::Client,
    /// One client per pinned (hostname, address), built on first use.
    pinned: Mutex<HashMap<(String, SocketAddr), reqwest::Client>>,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Self::builder(timeout)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        Ok(Self {
            timeout,
            client,
            pinned: Mutex::new(HashMap::new()),
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder().timeout(timeout)
    }

    fn client_for(&self, route: &Route) -> Result<reqwest::Client, ProbeError> {
        let Some((hostname, addr)) = &route.pin else {
            return Ok(self.client.clone());
        };

        let mut pinned = self.pinned.lock().unwrap();
        if let Some(client) = pinned.get(&(hostname.clone(), *addr)) {
            return Ok(client.clone());
        }

        let client = Self::builder(self.timeout)
            .resolve(hostname, *addr)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        pinned.insert((hostname.clone(), *addr), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &PreparedRequest) -> Result<FetchResponse, ProbeError> {
        let route = route(request)?;
        let client = self.client_for(&route)?;

        let mut builder = client.get(route.url);
        if let Some(hostname) = &request.hostname {
            builder = builder.header(HOST, hostname);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, password.as_ref());
        }

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else if e.is_builder() {
                ProbeError::Request(e.to_string())
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        Ok(FetchResponse {
            status: response.status().as_u16(),
            elapsed: start.elapsed(),
        })
    }
}

/// Result of the HTTP stage of one monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpOutcome {
    pub tally: Tally,
    /// Most recent request failure, if any.
    pub last_error: Option<String>,
}

/// Run every target path of the monitor and send one aggregate report.
pub async fn run_http_check(monitor: &MonitorDefinition, ctx: &ProbeContext) -> HttpOutcome {
    tracing::debug!("Start http monitor");
    let mut stats = HttpStats::default();
    let mut last_error = None;

    for target in &monitor.http {
        let span = tracing::info_span!(
            "http_target",
            hostname = %target.hostname,
            https = target.use_tls,
            port = target.port
        );
        check_target(&monitor.ip, target, ctx, &mut stats, &mut last_error)
            .instrument(span)
            .await;
    }

    tracing::info!(
        min = ?stats.min,
        avg = ?stats.avg(),
        max = ?stats.max,
        success = stats.tally.good,
        failure = stats.tally.bad,
        "Http"
    );

    // Aggregated results always go to the first target's column.
    if let Some(first) = monitor.http.first() {
        ctx.publish(StatusReport::new(
            &monitor.machine,
            &first.column,
            stats.status(),
            stats.summary(),
        ))
        .await;
    }

    HttpOutcome {
        tally: stats.tally,
        last_error,
    }
}

async fn check_target(
    ip: &str,
    target: &HttpTargetConfig,
    ctx: &ProbeContext,
    stats: &mut HttpStats,
    last_error: &mut Option<String>,
) {
    for path in &target.paths {
        let request = match build_request(ip, target, path) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(path = %path, context = "Create Request", "{}", e);
                stats.record_bad();
                *last_error = Some(e.to_string());
                continue;
            }
        };

        match ctx.fetcher.fetch(&request).await {
            Err(e) => {
                tracing::error!(path = %path, context = "Send request", "{}", e);
                stats.record_bad();
                *last_error = Some(e.to_string());
            }
            Ok(response) if !is_good_status(response.status) => {
                tracing::info!(url = %request.url, response = response.status, "Invalid HTTP response");
                stats.record_bad();
            }
            Ok(response) => {
                tracing::info!(url = %request.url, response = response.status, "Good HTTP response");
                stats.record_good(response.elapsed);
            }
        }
    }
}
