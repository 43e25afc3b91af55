//! Probe module for remote health checks.
//!
//! Supports ICMP ping, HTTP(S) and SMTP probes. Each probe turns a monitor's
//! configuration into a pass/fail result plus a statistics block and hands
//! its report to the shared [`ProbeContext`].

mod http;
mod mail;
mod ping;

pub use http::*;
pub use mail::*;
pub use ping::*;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::report::{StatusReport, StatusReporter};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Shared collaborators handed to every probe of a run.
#[derive(Clone)]
pub struct ProbeContext {
    pub reporter: Arc<dyn StatusReporter>,
    pub pinger: Arc<dyn Pinger>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub mailer: Arc<dyn MailProber>,
    pub icmp_lock: IcmpLock,
    pub dry_run: bool,
}

impl ProbeContext {
    /// Submit a report unless running dry. Failures are logged only; they
    /// never change the outcome of the probe that produced the report.
    pub async fn publish(&self, report: StatusReport) {
        if self.dry_run {
            tracing::debug!(
                column = %report.column,
                color = %report.status,
                "Dry run, not reporting"
            );
            return;
        }

        if let Err(e) = self.reporter.submit(&report).await {
            tracing::error!(
                machine = %report.machine,
                column = %report.column,
                "Failed to report status: {}",
                e
            );
        }
    }
}

/// Render a duration in microseconds with five decimals.
pub(crate) fn format_micros(d: Duration) -> String {
    format!("{:.5}", d.as_nanos() as f64 / 1000.0)
}
